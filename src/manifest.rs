//! Rendering, parsing, applying and reaping multi-document manifests.
//!
//! Templates use `{{ name }}` placeholders over a flat variable bag. A variable
//! that is not in the bag fails the render unless the template marks it optional
//! with the `default` filter (`{{ tolerations | default("") }}`).

use base64::{Engine as _, engine::general_purpose};
use minijinja::{Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::client::{ClusterClient, ObjectHandle};
use crate::embedded;
use crate::error::{Error, Result};
use crate::schemaless::FieldPath;

pub const TEMPLATE_SUFFIX: &str = ".j2";

/// Flat, case-sensitive variable bag for template rendering
#[derive(Debug, Clone, Default, Serialize)]
pub struct Vars(BTreeMap<String, serde_json::Value>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        // serialising plain values into JSON cannot fail for the types used here
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }
}

/// Expand a template with the given variables
pub fn render(name: &str, template: &str, vars: &Vars) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.add_template(name, template)?;
    let rendered = env.get_template(name)?.render(vars)?;
    Ok(rendered)
}

/// One document of a rendered manifest
#[derive(Debug, Clone)]
pub struct ManifestDocument {
    pub handle: ObjectHandle,
    pub body: serde_json::Value,
}

/// A rendered manifest and its parsed documents, in declared order
#[derive(Debug, Clone)]
pub struct ManifestSet {
    pub name: String,
    pub rendered: String,
    documents: Vec<ManifestDocument>,
}

impl ManifestSet {
    /// Parse `---` separated documents; empty documents are skipped
    pub fn parse(name: impl Into<String>, rendered: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let rendered = rendered.into();

        let mut documents = Vec::new();
        for (index, document) in serde_yaml::Deserializer::from_str(&rendered).enumerate() {
            let body = serde_json::Value::deserialize(document)
                .map_err(|e| Error::config(format!("{name} document {index}: {e}")))?;
            if body.is_null() {
                continue;
            }
            let handle = document_handle(&body)
                .map_err(|e| e.in_document(format!("{name} document {index}")))?;
            documents.push(ManifestDocument { handle, body });
        }

        Ok(Self {
            name,
            rendered,
            documents,
        })
    }

    pub fn documents(&self) -> &[ManifestDocument] {
        &self.documents
    }

    /// Identities in apply order
    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.documents.iter().map(|d| d.handle.clone()).collect()
    }

    /// Identities in delete order, the exact reverse of apply order
    pub fn deletion_order(&self) -> Vec<ObjectHandle> {
        self.documents
            .iter()
            .rev()
            .map(|d| d.handle.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

fn document_handle(body: &serde_json::Value) -> Result<ObjectHandle> {
    let api_version = body
        .field_str("apiVersion")
        .ok_or_else(|| Error::config("manifest missing apiVersion"))?;
    let kind = body
        .field_str("kind")
        .ok_or_else(|| Error::config("manifest missing kind"))?;
    let name = body
        .field_str("metadata.name")
        .ok_or_else(|| Error::config("manifest missing metadata.name"))?;
    Ok(ObjectHandle::new(
        api_version,
        kind,
        body.field_str("metadata.namespace"),
        name,
    ))
}

/// Where manifest bundles are read from
#[derive(Debug, Clone, Default)]
pub struct BundleSource {
    /// Directory whose `<bundle>/` subdirectories override the embedded bundles
    pub override_dir: Option<PathBuf>,
}

impl BundleSource {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self { override_dir }
    }

    /// Files of a bundle as (filename, text), sorted by filename
    pub fn files(&self, bundle: &str) -> Result<Vec<(String, String)>> {
        if let Some(dir) = &self.override_dir {
            let path = dir.join(bundle);
            if path.is_dir() {
                return read_bundle_dir(&path);
            }
        }

        let files = embedded::bundle_files(bundle)
            .ok_or_else(|| Error::config(format!("unknown manifest bundle '{bundle}'")))?;
        files
            .iter()
            .map(|(filename, encoded)| {
                let bytes = general_purpose::STANDARD.decode(encoded).map_err(|e| {
                    Error::config(format!("embedded manifest {bundle}/{filename}: {e}"))
                })?;
                let text = String::from_utf8(bytes).map_err(|e| {
                    Error::config(format!("embedded manifest {bundle}/{filename}: {e}"))
                })?;
                Ok((filename.to_string(), text))
            })
            .collect()
    }

    /// Render every file of a bundle (templates through [`render`]) into one set
    pub fn render_bundle(&self, bundle: &str, vars: &Vars) -> Result<ManifestSet> {
        let mut rendered = String::new();
        for (filename, text) in self.files(bundle)? {
            let body = if filename.ends_with(TEMPLATE_SUFFIX) {
                render(&filename, &text, vars)?
            } else {
                text
            };
            if !rendered.is_empty() {
                rendered.push_str("\n---\n");
            }
            rendered.push_str(&body);
        }
        ManifestSet::parse(bundle, rendered)
    }
}

fn read_bundle_dir(path: &Path) -> Result<Vec<(String, String)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry_path = entry?.path();
        if !entry_path.is_file() {
            continue;
        }
        let Some(filename) = entry_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        files.push((filename.to_string(), std::fs::read_to_string(&entry_path)?));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    debug!("Loaded {} manifest file(s) from {}", files.len(), path.display());
    Ok(files)
}

/// Apply every document in declared order, stopping at the first failure.
///
/// Documents applied before a failure stay on the cluster; the caller reaps
/// them by deleting the same set.
pub async fn apply(client: &ClusterClient, set: &ManifestSet) -> Result<Vec<ObjectHandle>> {
    info!("Applying manifest {} ({} documents)", set.name, set.documents.len());
    let mut applied = Vec::with_capacity(set.documents.len());
    for (index, document) in set.documents.iter().enumerate() {
        client
            .apply_dynamic(&document.handle, &document.body)
            .await
            .map_err(|e| e.in_document(format!("{} document {index} ({})", set.name, document.handle)))?;
        debug!("Applied {}", document.handle);
        applied.push(document.handle.clone());
    }
    Ok(applied)
}

/// Delete every document in reverse order, swallowing NotFound.
///
/// All documents are attempted; the first failure is returned afterwards.
pub async fn delete(client: &ClusterClient, set: &ManifestSet) -> Result<usize> {
    info!("Deleting manifest {}", set.name);
    let mut deleted = 0;
    let mut first_error = None;
    for handle in set.deletion_order() {
        match client.delete_dynamic(&handle).await {
            Ok(()) => {
                deleted += 1;
                debug!("Deleted {}", handle);
            }
            Err(e) if e.is_not_found() => debug!("{} already gone", handle),
            Err(e) => {
                warn!("Failed to delete {}: {}", handle, e);
                first_error.get_or_insert(e.in_document(format!("{} ({})", set.name, handle)));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(deleted),
    }
}

/// Apply several sets in order
pub async fn apply_all(client: &ClusterClient, sets: &[ManifestSet]) -> Result<()> {
    for set in sets {
        apply(client, set).await?;
    }
    Ok(())
}

/// Delete several sets, last applied first
pub async fn delete_all(client: &ClusterClient, sets: &[ManifestSet]) -> Result<()> {
    let mut first_error = None;
    for set in sets.iter().rev() {
        if let Err(e) = delete(client, set).await {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
