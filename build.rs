// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: bag root directory
fn bag_arg() -> Arg {
    Arg::new("bag")
        .required(true)
        .value_name("BAG")
        .help("Bag root directory")
}

/// Common argument: seconds to wait for a request
fn wait_arg() -> Arg {
    Arg::new("wait_secs")
        .long("wait-secs")
        .value_name("SECS")
        .help("Seconds to wait for the request to finish")
}

fn build_cli() -> Command {
    Command::new("aipbag")
        .version(env!("CARGO_PKG_VERSION"))
        .author("aipbag Contributors")
        .about("Build, validate and preserve dataset bags")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file (TOML); built-in defaults when omitted"),
        )
        .subcommand(
            Command::new("init")
                .about("Create a bag skeleton (or resume an existing bag)")
                .arg(bag_arg())
                .arg(Arg::new("id").long("id").required(true).help("Dataset identifier")),
        )
        .subcommand(
            Command::new("add")
                .about("Add a data file to a bag")
                .arg(bag_arg())
                .arg(Arg::new("file").required(true).help("File to copy into the bag"))
                .arg(
                    Arg::new("dest")
                        .long("dest")
                        .help("Path inside the data zone (defaults to the file name)"),
                ),
        )
        .subcommand(
            Command::new("set-meta")
                .about("Merge a JSON record into a component's metadata")
                .arg(bag_arg())
                .arg(
                    Arg::new("component")
                        .long("component")
                        .default_value("")
                        .help("Component path; empty for the resource record"),
                )
                .arg(Arg::new("record").required(true).help("JSON file holding the record")),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove a component and everything below it")
                .arg(bag_arg())
                .arg(Arg::new("component").required(true).help("Component path")),
        )
        .subcommand(
            Command::new("finalize")
                .about("Inject components and inventory, write manifests and tag files")
                .arg(bag_arg()),
        )
        .subcommand(
            Command::new("validate")
                .about("Validate a bag; exits non-zero when any PROB issue is found")
                .arg(bag_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print issues as JSON"),
                ),
        )
        .subcommand(
            Command::new("preserve")
                .about("Build, validate and archive a bag through the preservation service")
                .arg(Arg::new("id").long("id").required(true).help("Dataset identifier"))
                .arg(
                    Arg::new("metadata")
                        .long("metadata")
                        .required(true)
                        .help("Source metadata document"),
                )
                .arg(Arg::new("data").long("data").help("Directory of data files"))
                .arg(
                    Arg::new("transform")
                        .long("transform")
                        .help("Program converting source metadata to NERDm"),
                )
                .arg(
                    Arg::new("transform_arg")
                        .long("transform-arg")
                        .action(ArgAction::Append)
                        .help("Extra argument for the transform program"),
                )
                .arg(
                    Arg::new("archive")
                        .long("archive")
                        .required(true)
                        .help("Directory serialized bags are archived to"),
                )
                .arg(wait_arg()),
        )
        .subcommand(
            Command::new("status")
                .about("Show the status of a preservation request")
                .arg(Arg::new("target").required(true).help("Request ID or dataset identifier"))
                .arg(
                    Arg::new("identifier")
                        .long("identifier")
                        .action(ArgAction::SetTrue)
                        .help("Treat TARGET as a dataset identifier"),
                ),
        )
        .subcommand(
            Command::new("recover")
                .about("Fail interrupted builds and resume queued requests")
                .arg(
                    Arg::new("archive")
                        .long("archive")
                        .help("Archive directory; requeued requests run to completion"),
                )
                .arg(wait_arg()),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("aipbag.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
