use anyhow::{bail, Context, Result};
use bs_capture::{regions, ScreenRegion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

mod profiles;

pub use profiles::{InterfaceProfile, TargetProfile};

/// Prefix for environment overrides: `BSBOT_<SECTION>_<FIELD>`.
const ENV_PREFIX: &str = "BSBOT_";

/// Which detector the engine should try first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    #[default]
    Auto,
    Template,
    Text,
}

/// Runtime settings, loaded from `settings.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Name of the skill to run, looked up in the skill registry.
    pub skill: String,
    /// Planned inputs are only logged, never executed.
    pub dry_run: bool,
    pub capture: CaptureSettings,
    pub detection: DetectionSettings,
    pub combat: CombatSettings,
    pub grid: GridSettings,
    pub compass: CompassSettings,
    pub minimap: MinimapSettings,
    pub calibration: CalibrationSettings,
    pub tuning: Tuning,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            skill: "combat".to_string(),
            dry_run: true,
            capture: CaptureSettings::default(),
            detection: DetectionSettings::default(),
            combat: CombatSettings::default(),
            grid: GridSettings::default(),
            compass: CompassSettings::default(),
            minimap: MinimapSettings::default(),
            calibration: CalibrationSettings::default(),
            tuning: Tuning::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub window_titles: Vec<String>,
    /// Part of the game window handed to the core.
    pub region: ScreenRegion,
    pub interval_ms: u64,
    pub replay_dir: Option<PathBuf>,
    pub replay_loop: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            window_titles: vec!["brighter shores".to_string()],
            region: ScreenRegion::FULL,
            interval_ms: 100,
            replay_dir: None,
            replay_loop: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub method: DetectionMethod,
    pub tesseract_cmd: String,
    /// Nameplate template, relative to `data_dir` unless absolute.
    pub target_template: Option<PathBuf>,
    pub attack_template: Option<PathBuf>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            method: DetectionMethod::Auto,
            tesseract_cmd: "tesseract".to_string(),
            target_template: None,
            attack_template: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CombatSettings {
    /// Loads `data_dir/monsters/<id>.json` when set.
    pub monster_id: Option<String>,
    /// Loads `data_dir/interfaces/<id>.json` when set.
    pub interface_id: Option<String>,
    pub target_word: String,
    /// Secondary token that must sit next to the target word.
    pub prefix_word: Option<String>,
    pub attack_word: String,
    /// Floating label confirmed at the hover point. Defaults to `attack_word`.
    pub hover_word: Option<String>,
    pub prepare_terms: Vec<String>,
    /// Slot numbers accepted when picking a weapon; a read must equal one of them.
    pub weapon_digits: Vec<String>,
    /// Every token must be visible for the battle to count as active.
    pub battle_tokens: Vec<String>,
    pub nameplate_roi: Option<ScreenRegion>,
    pub attack_roi: Option<ScreenRegion>,
    pub prepare_roi: ScreenRegion,
    pub battle_roi: ScreenRegion,
}

impl Default for CombatSettings {
    fn default() -> Self {
        Self {
            monster_id: None,
            interface_id: None,
            target_word: String::new(),
            prefix_word: None,
            attack_word: "attack".to_string(),
            hover_word: None,
            prepare_terms: vec!["prepare".to_string(), "choose".to_string()],
            weapon_digits: vec!["1".to_string()],
            battle_tokens: vec!["special".to_string(), "attacks".to_string()],
            nameplate_roi: None,
            attack_roi: None,
            prepare_roi: regions::prepare_panel(),
            battle_roi: regions::battle_bar(),
        }
    }
}

impl CombatSettings {
    pub fn hover_word(&self) -> &str {
        self.hover_word.as_deref().unwrap_or(&self.attack_word)
    }
}

/// A calibration point: a frame position (fractions of the frame) and the tile it belongs to.
/// The point is the tile's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSample {
    pub x: f64,
    pub y: f64,
    pub row: i32,
    pub col: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    /// Empty disables tile tracking.
    pub samples: Vec<GridSample>,
    /// Where the player stands, as fractions of the frame.
    pub player_point: (f64, f64),
    /// Maximum accepted mean calibration error, in pixels.
    pub max_error_px: f64,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            samples: Vec::new(),
            player_point: (0.5, 0.5),
            max_error_px: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompassSettings {
    pub enabled: bool,
    pub roi: ScreenRegion,
    pub align_tolerance_deg: f64,
    /// Once aligned, re-align only past this deviation.
    pub drift_tolerance_deg: f64,
    pub rotation_rate_deg_s: f64,
    pub min_hold_s: f64,
    pub max_hold_s: f64,
    /// Cycles without convergence before the drift flag is raised.
    pub max_unconverged: u32,
    pub min_needle_area: u32,
}

impl Default for CompassSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            roi: regions::compass(),
            align_tolerance_deg: 5.0,
            drift_tolerance_deg: 8.0,
            rotation_rate_deg_s: 120.0,
            min_hold_s: 0.16,
            max_hold_s: 0.8,
            max_unconverged: 5,
            min_needle_area: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimapSettings {
    pub enabled: bool,
    pub toggle_key: String,
    pub coords_roi: ScreenRegion,
    pub interval_s: f64,
    pub open_delay_s: f64,
    /// Give up on a reading this long after the open delay.
    pub read_timeout_s: f64,
}

impl Default for MinimapSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            toggle_key: "m".to_string(),
            coords_roi: regions::minimap_coords(),
            interval_s: 45.0,
            open_delay_s: 0.45,
            read_timeout_s: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub enabled: bool,
    pub overrides_path: PathBuf,
    pub capture_dir: PathBuf,
    pub accept_threshold: f64,
    /// Bar for a template's very first override.
    pub bootstrap_threshold: f64,
    pub stable_enter_streak: u32,
    pub stable_exit_disagreements: u32,
    pub capture_cooldown_s: f64,
    pub recent_success_window_s: f64,
    pub duplicate_px: f64,
    pub duplicate_confidence: f64,
    /// Lowest template score the ROI sweep considers.
    pub search_min_score: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            overrides_path: PathBuf::from("roi_overrides.json"),
            capture_dir: PathBuf::from("captures/calibration"),
            accept_threshold: 0.90,
            bootstrap_threshold: 0.88,
            stable_enter_streak: 6,
            stable_exit_disagreements: 2,
            capture_cooldown_s: 25.0,
            recent_success_window_s: 30.0,
            duplicate_px: 6.0,
            duplicate_confidence: 0.05,
            search_min_score: 0.70,
        }
    }
}

/// Perception and decision tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Minimum normalized correlation for a template hit.
    pub template_threshold: f64,
    /// Boxes overlapping a better box above this IoU are dropped.
    pub nms_iou: f64,
    pub max_instances: usize,
    pub text_min_box: u32,
    pub text_max_box: u32,
    pub text_max_aspect: f64,
    pub ocr_scale: f64,
    /// Consecutive cycles without the battle cue before leaving the battle loop.
    pub absence_limit: u32,
    /// Minimum spacing between repeated clicks on the same element.
    pub reclick_interval_s: f64,
    /// How long an unobserved track survives on prediction alone.
    pub track_grace_s: f64,
    /// Same, for the locked track.
    pub lock_grace_s: f64,
    /// Weight of the previous velocity in the moving average.
    pub velocity_decay: f64,
    /// How long a merged nameplate box outlives its detections.
    pub box_lock_grace_s: f64,
    pub hover_check_interval_s: f64,
    pub history_len: usize,
    pub log_interval_s: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            template_threshold: 0.78,
            nms_iou: 0.5,
            max_instances: 10,
            text_min_box: 10,
            text_max_box: 200,
            text_max_aspect: 8.0,
            ocr_scale: 1.5,
            absence_limit: 6,
            reclick_interval_s: 0.8,
            track_grace_s: 0.6,
            lock_grace_s: 1.2,
            velocity_decay: 0.5,
            box_lock_grace_s: 1.2,
            hover_check_interval_s: 0.4,
            history_len: 6,
            log_interval_s: 2.0,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, then apply `BSBOT_*` environment overrides.
    /// A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let settings: Settings = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            tracing::info!("Loaded settings from {}", path.display());
            settings
        } else {
            tracing::warn!(
                "No settings file at {}, using defaults",
                path.display()
            );
            Settings::default()
        };
        settings.apply_overrides(std::env::vars())?;
        Ok(settings)
    }

    /// Apply `BSBOT_<SECTION>_<FIELD>` (or `BSBOT_<FIELD>` for top-level
    /// scalars) overrides. Values are parsed according to the field's current type.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        if vars.is_empty() {
            return Ok(0);
        }

        let mut value = serde_json::to_value(&*self).context("Failed to serialize settings")?;
        let mut applied = 0;
        if let Value::Object(sections) = &mut value {
            for (section, body) in sections.iter_mut() {
                match body {
                    Value::Object(fields) => {
                        for (field, slot) in fields.iter_mut() {
                            let key = format!(
                                "{}{}_{}",
                                ENV_PREFIX,
                                section.to_uppercase(),
                                field.to_uppercase()
                            );
                            if let Some(raw) = vars.get(&key) {
                                *slot = parse_like(slot, raw)
                                    .with_context(|| format!("Invalid value for {}", key))?;
                                applied += 1;
                            }
                        }
                    }
                    slot => {
                        let key = format!("{}{}", ENV_PREFIX, section.to_uppercase());
                        if let Some(raw) = vars.get(&key) {
                            *slot = parse_like(slot, raw)
                                .with_context(|| format!("Invalid value for {}", key))?;
                            applied += 1;
                        }
                    }
                }
            }
        }

        *self = serde_json::from_value(value).context("Environment override broke settings")?;
        if applied > 0 {
            tracing::info!("Applied {} environment overrides", applied);
        }
        Ok(applied)
    }

    /// Merge the monster and interface profiles named in the combat section.
    pub fn apply_profiles(&mut self) -> Result<()> {
        if let Some(id) = self.combat.monster_id.clone() {
            if let Some(profile) = TargetProfile::load(&self.data_dir, &id)? {
                profile.merge_into(&mut self.combat, &mut self.detection);
            }
        }
        if let Some(id) = self.combat.interface_id.clone() {
            if let Some(profile) = InterfaceProfile::load(&self.data_dir, &id)? {
                profile.merge_into(&mut self.combat, &mut self.detection);
            }
        }
        Ok(())
    }

    /// Reject settings the runtime cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.combat.target_word.trim().is_empty() && self.detection.target_template.is_none() {
            bail!("No target configured: set combat.target_word or detection.target_template");
        }
        if self.combat.attack_word.trim().is_empty() && self.detection.attack_template.is_none() {
            bail!("No attack prompt configured: set combat.attack_word or detection.attack_template");
        }
        for (name, v) in [
            ("tuning.template_threshold", self.tuning.template_threshold),
            ("tuning.nms_iou", self.tuning.nms_iou),
            ("tuning.velocity_decay", self.tuning.velocity_decay),
            ("calibration.accept_threshold", self.calibration.accept_threshold),
            ("calibration.bootstrap_threshold", self.calibration.bootstrap_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("{} must be within [0, 1], got {}", name, v);
            }
        }
        if self.capture.interval_ms == 0 {
            bail!("capture.interval_ms must be positive");
        }
        Ok(())
    }

    /// Resolve a configured path against `data_dir`.
    pub fn data_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

fn parse_like(current: &Value, raw: &str) -> Result<Value> {
    let parsed = match current {
        Value::Bool(_) => Value::Bool(raw.trim().parse::<bool>()?),
        Value::Number(n) if n.is_u64() => Value::from(raw.trim().parse::<u64>()?),
        Value::Number(n) if n.is_i64() => Value::from(raw.trim().parse::<i64>()?),
        Value::Number(_) => Value::from(raw.trim().parse::<f64>()?),
        Value::String(_) => Value::String(raw.to_string()),
        // Optional fields: structured JSON if it parses, a plain string otherwise
        Value::Null => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        Value::Array(_) | Value::Object(_) => serde_json::from_str(raw)?,
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_load_nonexistent() {
        let settings = Settings::load(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.skill, "combat");
        assert_eq!(settings.tuning.absence_limit, 6);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"combat": {"target_word": "wendigo"}, "tuning": {"nms_iou": 0.4}}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.combat.target_word, "wendigo");
        assert_eq!(settings.combat.attack_word, "attack");
        assert_eq!(settings.tuning.nms_iou, 0.4);
        assert_eq!(settings.tuning.template_threshold, 0.78);
        assert_eq!(settings.calibration.bootstrap_threshold, 0.88);
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn test_env_overrides_follow_field_types() {
        let mut settings = Settings::default();
        let applied = settings
            .apply_overrides(vars(&[
                ("BSBOT_COMBAT_TARGET_WORD", "wendigo"),
                ("BSBOT_TUNING_ABSENCE_LIMIT", "8"),
                ("BSBOT_TUNING_NMS_IOU", "0.35"),
                ("BSBOT_COMPASS_ENABLED", "true"),
                ("BSBOT_COMBAT_PREFIX_WORD", "grand"),
                ("BSBOT_DRY_RUN", "false"),
                ("HOME", "/root"),
            ]))
            .unwrap();

        assert_eq!(applied, 6);
        assert_eq!(settings.combat.target_word, "wendigo");
        assert_eq!(settings.tuning.absence_limit, 8);
        assert_eq!(settings.tuning.nms_iou, 0.35);
        assert!(settings.compass.enabled);
        assert_eq!(settings.combat.prefix_word.as_deref(), Some("grand"));
        assert!(!settings.dry_run);
    }

    #[test]
    fn test_env_override_rejects_bad_number() {
        let mut settings = Settings::default();
        let result = settings.apply_overrides(vars(&[("BSBOT_TUNING_ABSENCE_LIMIT", "many")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_requires_a_target() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_err());

        settings.combat.target_word = "wendigo".to_string();
        assert!(settings.validate().is_ok());

        settings.tuning.nms_iou = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_hover_word_defaults_to_attack_word() {
        let mut combat = CombatSettings::default();
        assert_eq!(combat.hover_word(), "attack");
        combat.hover_word = Some("fight".to_string());
        assert_eq!(combat.hover_word(), "fight");
    }
}
