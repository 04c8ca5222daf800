use crate::{CombatSettings, DetectionSettings};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What a monster's nameplate looks like: `data_dir/monsters/<id>.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetProfile {
    pub word: String,
    pub prefix: Option<String>,
    pub template: Option<PathBuf>,
}

/// Per-interface wording of the fight UI: `data_dir/interfaces/<id>.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceProfile {
    pub attack_word: Option<String>,
    pub attack_template: Option<PathBuf>,
    pub prepare_terms: Vec<String>,
    pub weapon_digits: Vec<String>,
    pub battle_tokens: Vec<String>,
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        tracing::warn!("No profile found at {}", path.display());
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let profile =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    tracing::info!("Loaded profile {}", path.display());
    Ok(Some(profile))
}

impl TargetProfile {
    pub fn load(data_dir: &Path, id: &str) -> Result<Option<Self>> {
        load_json(&data_dir.join("monsters").join(format!("{}.json", id)))
    }

    /// Profile values win over empty settings, explicit settings win over the profile.
    pub fn merge_into(&self, combat: &mut CombatSettings, detection: &mut DetectionSettings) {
        if combat.target_word.is_empty() && !self.word.is_empty() {
            combat.target_word = self.word.clone();
        }
        if combat.prefix_word.is_none() {
            combat.prefix_word = self.prefix.clone();
        }
        if detection.target_template.is_none() {
            detection.target_template = self.template.clone();
        }
    }
}

impl InterfaceProfile {
    pub fn load(data_dir: &Path, id: &str) -> Result<Option<Self>> {
        load_json(&data_dir.join("interfaces").join(format!("{}.json", id)))
    }

    pub fn merge_into(&self, combat: &mut CombatSettings, detection: &mut DetectionSettings) {
        if let Some(word) = &self.attack_word {
            combat.attack_word = word.clone();
        }
        if detection.attack_template.is_none() {
            detection.attack_template = self.attack_template.clone();
        }
        if !self.prepare_terms.is_empty() {
            combat.prepare_terms = self.prepare_terms.clone();
        }
        if !self.weapon_digits.is_empty() {
            combat.weapon_digits = self.weapon_digits.clone();
        }
        if !self.battle_tokens.is_empty() {
            combat.battle_tokens = self.battle_tokens.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Settings;

    #[test]
    fn test_missing_profile_is_none() {
        let profile = TargetProfile::load(Path::new("/nonexistent"), "wendigo").unwrap();
        assert!(profile.is_none());
    }

    #[test]
    fn test_profiles_merge_into_settings() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("monsters")).unwrap();
        std::fs::create_dir_all(tmp.path().join("interfaces")).unwrap();
        std::fs::write(
            tmp.path().join("monsters/wendigo.json"),
            r#"{"word": "wendigo", "prefix": "frost", "template": "templates/wendigo.png"}"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("interfaces/classic.json"),
            r#"{"attack_word": "fight", "battle_tokens": ["special"]}"#,
        )
        .unwrap();

        let mut settings = Settings {
            data_dir: tmp.path().to_path_buf(),
            ..Settings::default()
        };
        settings.combat.monster_id = Some("wendigo".into());
        settings.combat.interface_id = Some("classic".into());
        settings.apply_profiles().unwrap();

        assert_eq!(settings.combat.target_word, "wendigo");
        assert_eq!(settings.combat.prefix_word.as_deref(), Some("frost"));
        assert_eq!(
            settings.detection.target_template,
            Some(PathBuf::from("templates/wendigo.png"))
        );
        assert_eq!(settings.combat.attack_word, "fight");
        assert_eq!(settings.combat.battle_tokens, vec!["special".to_string()]);
        // untouched by the interface profile
        assert_eq!(settings.combat.weapon_digits, vec!["1".to_string()]);
    }

    #[test]
    fn test_interface_weapon_digits_replace_default() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("interfaces")).unwrap();
        std::fs::write(
            tmp.path().join("interfaces/dual.json"),
            r#"{"weapon_digits": ["2", "3"]}"#,
        )
        .unwrap();

        let mut settings = Settings {
            data_dir: tmp.path().to_path_buf(),
            ..Settings::default()
        };
        settings.combat.interface_id = Some("dual".into());
        settings.apply_profiles().unwrap();
        assert_eq!(settings.combat.weapon_digits, vec!["2".to_string(), "3".to_string()]);
        assert_eq!(settings.combat.attack_word, "attack");
    }
}
