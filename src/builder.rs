// src/builder.rs

//! Preservation bag builder
//!
//! Places data files, merges component metadata, and on `finalize` injects the
//! component list and inventory into the resource record and writes the
//! manifests. Every single-file write is atomic (temp file, then rename), so
//! a failure leaves that file as it was; a bag may still be left part-way
//! through a build, and building it again resumes from there.

use crate::bag::info::{BAGGING_DATE, BAGIT_DECLARATION, EXTERNAL_IDENTIFIER, SOFTWARE_AGENT};
use crate::bag::{
    self, Bag, BagInfo, BagLock, BuildLog, BuildLogRecord, BuildOperation, BuildOutcome,
    Manifest, normalize_relpath, parent_path,
};
use crate::cancel::CancellationToken;
use crate::context::BuildContext;
use crate::external::RecordValidator;
use crate::hash::{self, HashAlgorithm, Hasher};
use crate::loadlog::{LoadLog, LoadResult};
use crate::nerdm::{self, Component, ComponentKind, ResourceRecord, merge_record};
use crate::{Error, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Component fields owned by the data file itself
const PAYLOAD_FIELDS: [&str; 3] = ["filepath", "size", "checksum"];

/// Builds one bag; holds the bag's lock for its lifetime
pub struct BagBuilder {
    ctx: BuildContext,
    bag: Bag,
    identifier: String,
    algorithm: HashAlgorithm,
    log: BuildLog,
    warnings: Vec<String>,
    _lock: BagLock,
}

impl BagBuilder {
    /// Create the bag skeleton, or take over an existing bag for the same identifier
    ///
    /// Never removes existing content. Fails with `Rerequest` if another
    /// builder holds the bag, and with `Conflict` if the bag belongs to a
    /// different identifier.
    pub fn initialize(ctx: &BuildContext, identifier: &str, root: &Path) -> Result<Self> {
        let lock = BagLock::for_bag(root)?;
        Self::initialize_locked(ctx, identifier, root, lock)
    }

    /// [`initialize`](Self::initialize) with a bag lock the caller already holds
    pub fn initialize_locked(
        ctx: &BuildContext,
        identifier: &str,
        root: &Path,
        lock: BagLock,
    ) -> Result<Self> {
        let span = ctx.span().clone();
        let _enter = span.enter();

        if identifier.trim().is_empty() {
            return Err(Error::InvalidRecord("identifier must not be empty".to_string()));
        }

        let bag = Bag::new(root);

        fs::create_dir_all(bag.data_dir())?;
        fs::create_dir_all(bag.metadata_dir())?;
        if !bag.exists(&bag.bagit_path()) {
            bag.write(&bag.bagit_path(), BAGIT_DECLARATION.as_bytes())?;
        }

        let record_path = bag.resource_record_path();
        if bag.exists(&record_path) {
            let existing = ResourceRecord::from_value(bag.read_json(&record_path)?)?;
            if let Some(existing_id) = existing.id() {
                if existing_id != identifier {
                    return Err(Error::Conflict {
                        path: "metadata/record.json".to_string(),
                        expected: existing_id.to_string(),
                        actual: identifier.to_string(),
                    });
                }
            }
            debug!("Resuming existing bag {}", bag.name());
        } else {
            let mut record = ResourceRecord::new();
            record.set("@id", Value::String(identifier.to_string()));
            record.set("ediid", Value::String(identifier.to_string()));
            bag.write_json(&record_path, &record.into_value())?;
        }

        let mut log = BuildLog::open(&bag.build_log_path())?;
        log.append(&BuildLogRecord::new(
            identifier,
            BuildOperation::Initialize,
            BuildOutcome::Succeeded,
        ))?;

        info!("Initialized bag {} at {}", bag.name(), bag.root().display());

        Ok(Self {
            ctx: ctx.clone(),
            bag,
            identifier: identifier.to_string(),
            algorithm: ctx.checksum(),
            log,
            warnings: Vec::new(),
            _lock: lock,
        })
    }

    /// Open an existing bag, taking its identifier from the resource record
    pub fn open(ctx: &BuildContext, root: &Path) -> Result<Self> {
        let bag = Bag::open(root)?;
        let record = ResourceRecord::from_value(bag.read_json(&bag.resource_record_path())?)?;
        let identifier = record
            .id()
            .or_else(|| record.ediid())
            .ok_or_else(|| {
                Error::InvalidRecord(format!("{} has no @id", bag.resource_record_path().display()))
            })?
            .to_string();
        Self::initialize(ctx, &identifier, root)
    }

    pub fn bag(&self) -> &Bag {
        &self.bag
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Non-fatal problems found by the last `finalize`
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Copy a file's bytes into the data zone
    ///
    /// Identical content already in place is a no-op; different content is a
    /// `Conflict`. The file's component record is created or updated, along
    /// with a sub-collection record for every ancestor directory.
    pub fn add_data_file<R: Read>(&mut self, relpath: &str, mut source: R) -> Result<()> {
        let span = self.ctx.span().clone();
        let _enter = span.enter();

        let rel = normalize_relpath(relpath)?;
        let dest = self.bag.data_file_path(&rel)?;
        if dest.is_dir() {
            return Err(Error::InvalidPath(format!(
                "data/{} is a collection, not a file",
                rel
            )));
        }
        let parent = dest
            .parent()
            .ok_or_else(|| Error::InvalidPath(format!("no parent for data/{}", rel)))?;
        fs::create_dir_all(parent)?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        let mut hasher = Hasher::new(self.algorithm);
        let mut buffer = [0u8; 8192];
        let mut size = 0u64;
        loop {
            let n = source.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            temp.write_all(&buffer[..n])?;
            size += n as u64;
        }
        let digest = hasher.finalize();

        if dest.is_file() {
            let existing = hash::hash_file(self.algorithm, &dest)?;
            if !hash::digests_match(&existing, &digest) {
                return Err(Error::Conflict {
                    path: format!("data/{}", rel),
                    expected: existing,
                    actual: digest,
                });
            }
            debug!("data/{} already present with identical content", rel);
        } else {
            temp.as_file().sync_all()?;
            temp.persist(&dest).map_err(|e| Error::Io(e.error))?;
            debug!("Added data/{} ({} bytes)", rel, size);
        }

        self.ensure_collections(parent_path(&rel))?;
        self.record_payload(&rel, size, &digest)
    }

    /// Bring a file's component record in line with the bytes in the data zone
    ///
    /// `filepath`, `size` and `checksum` always follow the payload. `@id`,
    /// `@type` and `mediaType` are only filled in when the record lacks them.
    /// An up-to-date record is not rewritten.
    fn record_payload(&mut self, rel: &str, size: u64, digest: &str) -> Result<()> {
        let path = self.bag.metadata_record_path(rel)?;
        let mut record = if self.bag.exists(&path) {
            match self.bag.read_json(&path)? {
                Value::Object(map) => map,
                _ => {
                    return Err(Error::InvalidRecord(format!(
                        "{} is not a JSON object",
                        path.display()
                    )));
                }
            }
        } else {
            Map::new()
        };

        let Value::Object(template) =
            nerdm::file_component_record(rel, size, self.algorithm, digest)
        else {
            return Err(Error::InvalidRecord(format!("no component template for {}", rel)));
        };

        let mut changed = false;
        for (field, value) in template {
            if PAYLOAD_FIELDS.contains(&field.as_str()) {
                if record.get(&field) != Some(&value) {
                    record.insert(field, value);
                    changed = true;
                }
            } else if !record.contains_key(&field) {
                record.insert(field, value);
                changed = true;
            }
        }

        if changed {
            self.bag.write_json(&path, &Value::Object(record))?;
        }
        Ok(())
    }

    /// Merge a record into the metadata zone at the mirrored path
    ///
    /// `""` addresses the resource record. See [`merge_record`] for the policy.
    pub fn set_component_metadata(&mut self, relpath: &str, record: &Value) -> Result<()> {
        let update = record.as_object().ok_or_else(|| {
            Error::InvalidRecord(format!("metadata for '{}' must be a JSON object", relpath))
        })?;

        let rel = normalize_relpath(relpath)?;
        let path = self.bag.metadata_record_path(&rel)?;

        let mut current = if self.bag.exists(&path) {
            match self.bag.read_json(&path)? {
                Value::Object(map) => map,
                _ => {
                    return Err(Error::InvalidRecord(format!(
                        "{} is not a JSON object",
                        path.display()
                    )));
                }
            }
        } else {
            Map::new()
        };

        merge_record(&mut current, update);
        if !rel.is_empty() {
            current.insert("filepath".to_string(), Value::String(rel.clone()));
        }

        self.bag.write_json(&path, &Value::Object(current))
    }

    /// Remove a component's record and data; a collection takes its subtree with it
    pub fn remove_component(&mut self, relpath: &str) -> Result<()> {
        let rel = normalize_relpath(relpath)?;
        if rel.is_empty() {
            return Err(Error::InvalidPath("cannot remove the root collection".to_string()));
        }

        let mut found = false;
        let meta_dir = self.bag.metadata_dir().join(&rel);
        if meta_dir.is_dir() {
            fs::remove_dir_all(&meta_dir)?;
            found = true;
        }

        let data_path = self.bag.data_dir().join(&rel);
        if data_path.is_dir() {
            fs::remove_dir_all(&data_path)?;
            found = true;
        } else if data_path.is_file() {
            fs::remove_file(&data_path)?;
            found = true;
        }

        if !found {
            return Err(Error::NotFound(format!("component {}", rel)));
        }
        info!("Removed component {}", rel);
        Ok(())
    }

    /// Import every file below a directory into the data zone
    ///
    /// Per-file failures are recorded rather than aborting the import.
    pub fn add_data_files_from(
        &mut self,
        source_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<LoadLog> {
        if !source_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "data directory {}",
                source_dir.display()
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(source_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        let mut log = LoadLog::new();
        for path in files {
            cancel.checkpoint()?;

            let rel = path
                .strip_prefix(source_dir)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();

            let outcome = File::open(&path)
                .map_err(Error::from)
                .and_then(|file| self.add_data_file(&rel, file));
            match outcome {
                Ok(()) => log.add(LoadResult::success(rel)),
                Err(e) => {
                    warn!("Failed to add data/{}: {}", rel, e);
                    log.add(LoadResult::failure(rel, vec![e.to_string()]))
                }
            };
        }

        Ok(log)
    }

    /// Persist the components of a NERDm record
    ///
    /// Components with a `filepath` are checked by `validator` and merged into
    /// the metadata zone; the rest are kept on the resource record.
    pub fn load_components(
        &mut self,
        components: &[Value],
        validator: &dyn RecordValidator,
        cancel: &CancellationToken,
    ) -> Result<LoadLog> {
        let mut log = LoadLog::new();
        let mut resource_level = Vec::new();

        for component in components {
            cancel.checkpoint()?;

            let Some(position) = Component::from_record(component) else {
                resource_level.push(component.clone());
                continue;
            };
            if position.path.is_empty() {
                log.add(LoadResult::failure(
                    "",
                    vec!["component filepath must not be empty".to_string()],
                ));
                continue;
            }

            let violations = validator.validate(component);
            if !violations.is_empty() {
                log.add(LoadResult::failure(position.path, violations));
                continue;
            }

            if position.kind == ComponentKind::Collection {
                self.ensure_collections(&position.path)?;
            } else {
                self.ensure_collections(parent_path(&position.path))?;
            }

            match self.set_component_metadata(&position.path, component) {
                Ok(()) => log.add(LoadResult::success(position.path)),
                Err(e) => log.add(LoadResult::failure(position.path, vec![e.to_string()])),
            };
        }

        let mut root = Map::new();
        root.insert("components".to_string(), Value::Array(resource_level));
        self.set_component_metadata("", &Value::Object(root))?;

        Ok(log)
    }

    /// Complete the bag and return its resource record
    ///
    /// Calling it again without changes produces a byte-identical record.
    pub fn finalize(&mut self) -> Result<ResourceRecord> {
        let span = self.ctx.span().clone();
        let _enter = span.enter();

        let result = self.finalize_inner();
        let outcome = match &result {
            Ok(_) => BuildOutcome::Succeeded,
            Err(e) => BuildOutcome::Failed {
                reason: e.to_string(),
            },
        };

        let entry = BuildLogRecord::new(&self.identifier, BuildOperation::Finalize, outcome);
        match (result, self.log.append(&entry)) {
            (Ok(record), Ok(())) => Ok(record),
            (Ok(_), Err(log_err)) => Err(log_err),
            (Err(e), log_result) => {
                if let Err(log_err) = log_result {
                    warn!("Could not record failed finalize in build log: {}", log_err);
                }
                Err(e)
            }
        }
    }

    fn finalize_inner(&mut self) -> Result<ResourceRecord> {
        self.warnings.clear();

        let mut gathered = Vec::new();
        let mut hierarchy = Vec::new();
        for path in self.bag.component_paths()? {
            let record_path = self.bag.metadata_record_path(&path)?;
            let mut record = match self.bag.read_json(&record_path)? {
                Value::Object(map) => map,
                _ => {
                    return Err(Error::InvalidRecord(format!(
                        "{} is not a JSON object",
                        record_path.display()
                    )));
                }
            };
            record.insert("filepath".to_string(), Value::String(path.clone()));
            let record = Value::Object(record);
            hierarchy.push(Component::new(&path, ComponentKind::from_record(&record)));
            gathered.push(record);
        }

        let report = nerdm::assemble(&hierarchy);
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        self.warnings.extend(report.warnings.iter().cloned());

        let record_path = self.bag.resource_record_path();
        let mut resource = if self.bag.exists(&record_path) {
            ResourceRecord::from_value(self.bag.read_json(&record_path)?)?
        } else {
            ResourceRecord::new()
        };

        let mut components: Vec<Value> = resource
            .components()
            .iter()
            .filter(|c| c.get("filepath").is_none())
            .cloned()
            .collect();
        components.extend(gathered);

        if resource.id().is_none() {
            resource.set("@id", Value::String(self.identifier.clone()));
        }
        if resource.ediid().is_none() {
            resource.set("ediid", Value::String(self.identifier.clone()));
        }
        resource.set("components", Value::Array(components));
        resource.set("inventory", serde_json::to_value(&report.entries)?);

        self.bag
            .write_json(&record_path, &resource.clone().into_value())?;

        let (octets, count) = self.write_manifest()?;
        self.write_bag_info(octets, count)?;
        self.write_tagmanifest()?;

        info!(
            components = hierarchy.len(),
            files = count,
            "Finalized bag {}",
            self.bag.name()
        );
        Ok(resource)
    }

    /// Payload manifest over every data file; returns (octets, file count)
    fn write_manifest(&self) -> Result<(u64, u64)> {
        let mut manifest = Manifest::new(self.algorithm);
        let mut octets = 0u64;
        let files = self.bag.data_files()?;

        for rel in &files {
            let path = self.bag.data_file_path(rel)?;
            let mut file = File::open(&path)?;
            let (digest, size) = hash::hash_reader(self.algorithm, &mut file)?;
            manifest.insert(format!("{}/{}", bag::DATA_DIR, rel), digest);
            octets += size;
        }

        self.bag.write(
            &self.bag.manifest_path(self.algorithm),
            manifest.render().as_bytes(),
        )?;
        Ok((octets, files.len() as u64))
    }

    fn write_bag_info(&self, octets: u64, count: u64) -> Result<()> {
        let path = self.bag.bag_info_path();
        let mut bag_info = if self.bag.exists(&path) {
            BagInfo::parse(&self.bag.read_to_string(&path)?)?
        } else {
            BagInfo::new()
        };

        if bag_info.get(BAGGING_DATE).is_none() {
            bag_info.set(
                BAGGING_DATE,
                chrono::Utc::now().format("%Y-%m-%d").to_string(),
            );
        }
        bag_info.set(EXTERNAL_IDENTIFIER, self.identifier.clone());
        bag_info.set(
            SOFTWARE_AGENT,
            format!("aipbag/{}", env!("CARGO_PKG_VERSION")),
        );
        bag_info.set_payload_oxum(octets, count);

        self.bag.write(&path, bag_info.render().as_bytes())
    }

    /// Tag manifest over the declaration, bag-info, payload manifest and metadata zone
    fn write_tagmanifest(&self) -> Result<()> {
        let mut tagged = vec![
            bag::BAGIT_TXT.to_string(),
            bag::BAG_INFO_TXT.to_string(),
            bag::manifest_name(self.algorithm),
        ];
        tagged.extend(self.bag.metadata_files()?);

        let mut manifest = Manifest::new(self.algorithm);
        for rel in tagged {
            let path = self.bag.root().join(&rel);
            if path.is_file() {
                manifest.insert(rel, hash::hash_file(self.algorithm, &path)?);
            }
        }

        self.bag.write(
            &self.bag.tagmanifest_path(self.algorithm),
            manifest.render().as_bytes(),
        )
    }

    /// Write the bag as `<dest_dir>/<name>.tar.gz`, entries prefixed by the bag name
    pub fn serialize(&self, dest_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(format!("{}.tar.gz", self.bag.name()));

        let temp = tempfile::NamedTempFile::new_in(dest_dir)?;
        let encoder = GzEncoder::new(temp.as_file(), Compression::default());
        let mut archive = tar::Builder::new(encoder);
        archive.append_dir_all(self.bag.name(), self.bag.root())?;
        archive.into_inner()?.finish()?;

        temp.as_file().sync_all()?;
        temp.persist(&dest).map_err(|e| Error::Io(e.error))?;
        info!("Serialized bag {} to {}", self.bag.name(), dest.display());
        Ok(dest)
    }

    /// Make sure every collection from the root down to `collection` has a record
    fn ensure_collections(&mut self, collection: &str) -> Result<()> {
        if collection.is_empty() {
            return Ok(());
        }

        let mut prefix = String::new();
        for segment in collection.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);

            let path = self.bag.metadata_record_path(&prefix)?;
            if !self.bag.exists(&path) {
                self.bag
                    .write_json(&path, &nerdm::collection_component_record(&prefix))?;
            }
        }
        Ok(())
    }
}
