//! Reads the channels and dependencies out of a conda `environment.yml` file

use std::path::{Path, PathBuf};

use thiserror::Error;
use yaml_rust::{Yaml, YamlLoader};

#[derive(Debug, Error)]
pub enum EnvironmentFileError {
    #[error("unable to read environment file {}", .0.display())]
    Read(PathBuf, #[source] std::io::Error),
    #[error("invalid YAML in environment file")]
    Yaml(#[from] yaml_rust::ScanError),
    #[error("environment file must contain a mapping")]
    NotAMapping,
    #[error("`{0}` must be a list")]
    NotAList(&'static str),
    #[error("invalid entry in `{key}`: {value}")]
    InvalidEntry { key: &'static str, value: String },
    #[error("pip dependencies not supported")]
    PipDependencies,
}

/// The parts of an environment file that matter for resolving packages
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EnvironmentFile {
    pub channels: Vec<String>,
    pub specs: Vec<String>,
}

/// Parses the environment file at `path`
pub fn parse_environment_file(path: &Path) -> Result<EnvironmentFile, EnvironmentFileError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| EnvironmentFileError::Read(path.to_path_buf(), e))?;
    parse_environment_str(&contents)
}

pub fn parse_environment_str(contents: &str) -> Result<EnvironmentFile, EnvironmentFileError> {
    let documents = YamlLoader::load_from_str(contents)?;

    // An empty document is an environment without channels or dependencies
    let Some(document) = documents.into_iter().next() else {
        return Ok(EnvironmentFile::default());
    };
    if document.is_null() {
        return Ok(EnvironmentFile::default());
    }
    if document.as_hash().is_none() {
        return Err(EnvironmentFileError::NotAMapping);
    }

    Ok(EnvironmentFile {
        channels: string_list(&document, "channels")?,
        specs: string_list(&document, "dependencies")?,
    })
}

fn string_list(document: &Yaml, key: &'static str) -> Result<Vec<String>, EnvironmentFileError> {
    let entries = match &document[key] {
        Yaml::BadValue | Yaml::Null => return Ok(Vec::new()),
        Yaml::Array(entries) => entries,
        _ => return Err(EnvironmentFileError::NotAList(key)),
    };

    let mut values = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Yaml::String(value) => values.push(value.trim().to_string()),
            // `- pip: [...]` sub-sections hold pip requirements, which no conda solver understands
            Yaml::Hash(_) if key == "dependencies" => {
                return Err(EnvironmentFileError::PipDependencies)
            }
            other => {
                return Err(EnvironmentFileError::InvalidEntry {
                    key,
                    value: format!("{other:?}"),
                })
            }
        }
    }

    Ok(values)
}
