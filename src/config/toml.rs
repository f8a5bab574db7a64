use crate::config::{ConfigBackend, Configuration};
use anyhow::{Context, Error};
use std::path::Path;
use std::str::FromStr;
use toml_edit::DocumentMut;

#[derive(Debug, Clone)]
pub struct TomlConfiguration {
    document: DocumentMut,
}

impl TomlConfiguration {
    fn load_toml<P: AsRef<Path>>(file: P) -> Result<Self, Error> {
        let document = std::fs::read_to_string(file)?;
        Self::from_toml(&document)
    }

    fn from_toml(toml: &str) -> Result<Self, Error> {
        let document = DocumentMut::from_str(toml)?;
        Ok(Self { document })
    }

    fn into_configuration(self) -> Result<Configuration, Error> {
        Ok(toml_edit::de::from_document(self.document)?)
    }

    pub fn parse(toml: &str) -> Result<Configuration, Error> {
        Self::from_toml(toml)?.into_configuration()
    }
}

impl ConfigBackend for TomlConfiguration {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, Error> {
        let file = file.as_ref();
        let toml = Self::load_toml(file)
            .with_context(|| format!("Reading configuration file {}", file.display()))?;
        toml.into_configuration()
            .with_context(|| format!("Invalid configuration in {}", file.display()))
    }
}
