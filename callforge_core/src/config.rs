use crate::mutation::MutationWeights;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    /// Syscall names the choice table may pick; all of them when absent.
    #[serde(default)]
    pub enabled_calls: Option<Vec<String>>,
}

fn default_os() -> String {
    "linux".to_string()
}

fn default_arch() -> String {
    "amd64".to_string()
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            os: default_os(),
            arch: default_arch(),
            enabled_calls: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GenerationSettings {
    #[serde(default = "default_program_length")]
    pub program_length: usize,
    #[serde(default)]
    pub seed: u64,
}

pub fn default_program_length() -> usize {
    10
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            program_length: default_program_length(),
            seed: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutationSettings {
    #[serde(default = "default_rounds")]
    pub rounds: u64,
    #[serde(default)]
    pub weights: MutationWeights,
}

pub fn default_rounds() -> u64 {
    100
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            weights: MutationWeights::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MinimizationSettings {
    #[serde(default)]
    pub allow_partial_removal: bool,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    pub initial_seed_paths: Option<Vec<PathBuf>>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CallforgeConfig {
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub mutation: MutationSettings,
    #[serde(default)]
    pub minimization: MinimizationSettings,
    #[serde(default)]
    pub corpus: Option<CorpusConfig>,
}

impl CallforgeConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CallforgeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("callforge.toml");
        fs::write(&path, "").unwrap();
        let config = CallforgeConfig::load_from_file(&path).unwrap();
        assert_eq!(config, CallforgeConfig::default());
        assert_eq!(config.target.os, "linux");
        assert_eq!(config.generation.program_length, 10);
        assert_eq!(config.mutation.rounds, 100);
        assert_eq!(config.mutation.weights, MutationWeights::default());
        assert!(!config.minimization.allow_partial_removal);
        assert!(config.corpus.is_none());
    }

    #[test]
    fn full_file_is_parsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("callforge.toml");
        fs::write(
            &path,
            r#"
[target]
os = "test"
arch = "64"
enabled-calls = ["mutate0", "mutate4"]

[generation]
program-length = 5
seed = 42

[mutation]
rounds = 7
[mutation.weights]
splice = 0
insert-call = 1

[minimization]
allow-partial-removal = true

[corpus]
initial-seed-paths = ["./seeds"]
"#,
        )
        .unwrap();
        let config = CallforgeConfig::load_from_file(&path).unwrap();
        assert_eq!(config.target.os, "test");
        assert_eq!(
            config.target.enabled_calls,
            Some(vec!["mutate0".to_string(), "mutate4".to_string()])
        );
        assert_eq!(config.generation.program_length, 5);
        assert_eq!(config.generation.seed, 42);
        assert_eq!(config.mutation.rounds, 7);
        assert_eq!(config.mutation.weights.splice, 0);
        assert_eq!(config.mutation.weights.insert_call, 1);
        assert_eq!(config.mutation.weights.mutate_arg, 60);
        assert!(config.minimization.allow_partial_removal);
        assert_eq!(
            config.corpus.unwrap().initial_seed_paths,
            Some(vec![PathBuf::from("./seeds")])
        );
    }

    #[test]
    fn unknown_keys_and_missing_files_are_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("callforge.toml");
        fs::write(&path, "[generation]\nprogram-lenght = 3\n").unwrap();
        let err = CallforgeConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"), "{}", err);

        let missing = dir.path().join("missing.toml");
        let err = CallforgeConfig::load_from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"), "{}", err);
    }
}
