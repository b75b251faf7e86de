//! Repo-tool manifest model.
//!
//! A manifest pins every component repository of a build to a revision:
//!
//! ```text
//! <manifest>
//!   <remote name="origin" fetch="https://example.com"/>
//!   <default remote="origin" revision="master"/>
//!   <project name="kernel/linux" path="kernel/linux-5.10" revision="4f2e..."/>
//! </manifest>
//! ```
//!
//! Only the `(name, path, revision)` triples matter for build identity, so a
//! [`Manifest`] is a set of [`Project`]s and two manifests are equivalent when
//! their [`ManifestDigest`]s match, whatever order the XML listed them in.

use std::collections::BTreeSet;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{FirstFailError, Result};

/// One pinned repository.
///
/// Field order is the canonical sort key and serialization order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Project {
    pub name: String,
    pub path: String,
    pub revision: String,
}

/// Parsed, immutable manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    projects: BTreeSet<Project>,
}

/// Hex-encoded SHA-256 of a manifest's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestDigest(String);

impl ManifestDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attributes of a `<project>` before defaults are applied.
#[derive(Default)]
struct RawProject {
    name: Option<String>,
    path: Option<String>,
    revision: Option<String>,
}

impl Manifest {
    /// Parse manifest XML.
    ///
    /// Fails on malformed XML, a root element other than `<manifest>`, a
    /// project without `name`, or a project with no revision of its own and
    /// no `<default revision>` to inherit.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut depth = 0usize;
        let mut saw_root = false;
        let mut default_revision: Option<String> = None;
        let mut raw_projects = Vec::new();

        loop {
            let (element, level) = match reader.read_event()? {
                Event::Start(e) => {
                    depth += 1;
                    (e, depth)
                }
                Event::Empty(e) => (e, depth + 1),
                Event::End(_) => {
                    depth = depth.saturating_sub(1);
                    continue;
                }
                Event::Eof => break,
                _ => continue,
            };

            match level {
                1 => {
                    if element.local_name().as_ref() != b"manifest" {
                        return Err(FirstFailError::Parse(format!(
                            "unexpected root element <{}>, expected <manifest>",
                            String::from_utf8_lossy(element.local_name().as_ref())
                        )));
                    }
                    saw_root = true;
                }
                2 => match element.local_name().as_ref() {
                    b"project" => raw_projects.push(read_project(&element)?),
                    b"default" => {
                        if let Some(rev) = attribute(&element, b"revision")? {
                            default_revision = Some(rev);
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        if depth != 0 {
            return Err(FirstFailError::Parse(
                "manifest ended inside an open element".to_string(),
            ));
        }
        if !saw_root {
            return Err(FirstFailError::Parse(
                "missing <manifest> root element".to_string(),
            ));
        }

        let mut projects = BTreeSet::new();
        for raw in raw_projects {
            let name = raw.name.ok_or_else(|| {
                FirstFailError::Parse("<project> without a name attribute".to_string())
            })?;
            let revision = raw
                .revision
                .or_else(|| default_revision.clone())
                .ok_or_else(|| {
                    FirstFailError::Parse(format!(
                        "project {name} has no revision and the manifest has no default"
                    ))
                })?;
            let path = raw.path.unwrap_or_else(|| name.clone());
            projects.insert(Project {
                name,
                path,
                revision,
            });
        }

        Ok(Self { projects })
    }

    /// Read and parse a manifest file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path)?;
        Self::parse(&xml)
    }

    /// Projects in canonical order.
    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.iter()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Order-independent identity of this manifest.
    pub fn standardize(&self) -> Result<ManifestDigest> {
        let canonical: Vec<&Project> = self.projects.iter().collect();
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(ManifestDigest(hex::encode(Sha256::digest(&bytes))))
    }
}

fn read_project(element: &BytesStart<'_>) -> Result<RawProject> {
    Ok(RawProject {
        name: attribute(element, b"name")?,
        path: attribute(element, b"path")?,
        revision: attribute(element, b"revision")?,
    })
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}
