//! Loading [`PipelineConfig`] from TOML.

use std::path::Path;

use cohost_core::types::PipelineConfig;
use tracing::info;

use crate::error::{Error, Result};

/// Read and validate a config file. `None` yields the defaults.
pub fn load(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            let config = parse(&text)?;
            info!(path = %path.display(), "config loaded");
            config
        }
        None => PipelineConfig::default(),
    };
    config.validate().map_err(Error::Config)?;
    Ok(config)
}

/// Parse TOML without validating.
pub fn parse(text: &str) -> Result<PipelineConfig> {
    Ok(toml::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_path_gives_defaults() {
        let config = load(None).unwrap();
        assert_eq!(config.context_window, 5);
        assert_eq!(config.reasoning.timeout_secs, 10);
    }

    #[test]
    fn loads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            bot_name = "sidekick"

            [voice]
            voice = "am_adam"
            speed = 1.2

            [cache]
            audio_dir = "/tmp/cohost-audio"
            "#
        )
        .unwrap();
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.bot_name, "sidekick");
        assert_eq!(config.voice.voice, "am_adam");
        assert_eq!(
            config.cache.audio_dir.as_deref(),
            Some(Path::new("/tmp/cohost-audio"))
        );
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[audio]\nchannels = 5").unwrap();
        assert!(matches!(load(Some(file.path())), Err(Error::Config(_))));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(parse("context_window = ["), Err(Error::Toml(_))));
    }

    #[test]
    fn missing_file_is_config_error() {
        let res = load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
