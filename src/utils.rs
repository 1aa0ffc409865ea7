//! Common debimg utilities.

use clap::ValueEnum as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

/// Reads and parses a YAML file or stdin input into a specified type.
///
/// Reads from `path` if given, otherwise from stdin.
pub fn read_file<T: DeserializeOwned>(path: Option<&Path>) -> Result<T, Box<dyn std::error::Error>> {
    let content = match path {
        Some(file) => fs::read_to_string(file)
            .map_err(|err| format!("failed to read {}: {}", file.display(), err))?,
        None => {
            let mut contents = String::new();
            io::stdin().read_to_string(&mut contents)?;
            contents
        }
    };
    let parsed: T = serde_yaml::from_str(&content)?;
    Ok(parsed)
}

/// Possible output formats for command results.
#[derive(Copy, Clone, Debug, Default, PartialEq, clap::ValueEnum)]
#[value(rename_all = "lower")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
    PrettyJson,
    Toml,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.to_possible_value()
                .expect("no skipped values")
                .get_name()
        )
    }
}

/// Serializes an object in the specified format.
pub fn format_object<T: Serialize>(
    format: OutputFormat,
    value: &T,
) -> Result<String, Box<dyn std::error::Error>> {
    let output = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Json => serde_json::to_string(value)?,
        OutputFormat::PrettyJson => serde_json::to_string_pretty(value)?,
        OutputFormat::Toml => toml::to_string(value)?,
    };
    Ok(output)
}

/// Prints an object in the specified format.
pub fn print_object<T: Serialize>(
    format: OutputFormat,
    value: &T,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", format_object(format, value)?);
    Ok(())
}
