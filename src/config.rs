use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, CropcastResult};

// ================================================================================================
// Directory Layout
// ================================================================================================

/// Filesystem layout for one deployment rooted at `root`.
///
/// All paths are directories. Collectors append timestamped file names, so the
/// directories are append-only from any single run's perspective.
#[derive(Debug, Clone)]
pub struct Dirs {
    pub root: PathBuf,
    /// Layered store root (`bronze/`, `silver/`, `gold/`, `reference/` below it).
    pub data_dir: PathBuf,
    /// Raw response archive: `{endpoint}_{identifier}_{timestamp}.{json|csv|pdf}`.
    pub raw_dir: PathBuf,
    /// Fetch cache: `{md5_of_args}.json`, TTL-gated by mtime.
    pub cache_dir: PathBuf,
    /// Audit logs: `{collector}_{YYYY-MM-DD}_{HH-MM-SS}.log`.
    pub log_dir: PathBuf,
    /// Trained model artifacts: `models/yield/{crop}_{model}.json`.
    pub model_dir: PathBuf,
    /// JSON tuning tables (thresholds, calendars, synonyms, patterns).
    pub config_dir: PathBuf,
}

impl Dirs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            data_dir: root.join("data"),
            raw_dir: root.join("data/raw"),
            cache_dir: root.join("data/cache"),
            log_dir: root.join("logs"),
            model_dir: root.join("models/yield"),
            config_dir: root.join("config"),
            root,
        }
    }

    /// Create every directory that does not exist yet.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            &self.data_dir,
            &self.raw_dir,
            &self.cache_dir,
            &self.log_dir,
            &self.model_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

// ================================================================================================
// Credentials
// ================================================================================================

/// Resolve the first set variable from a fallback chain of environment names.
pub fn env_chain(names: &[&str]) -> Result<String, ConfigError> {
    for name in names {
        if let Ok(value) = std::env::var(name) {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }
    Err(ConfigError::MissingEnv(names.join(" | ")))
}

/// Well-known credential lookups. Values never appear in logs or run summaries.
pub mod credentials {
    use super::env_chain;
    use crate::error::ConfigError;

    pub fn nass_api_key() -> Result<String, ConfigError> {
        env_chain(&["NASS_API_KEY"])
    }

    pub fn usda_ams_api_key() -> Result<String, ConfigError> {
        env_chain(&["USDA_AMS_API_KEY", "AMS_API_KEY"])
    }

    pub fn eia_api_key() -> Result<String, ConfigError> {
        env_chain(&["EIA_API_KEY"])
    }

    pub fn gtt_login() -> Result<(String, String), ConfigError> {
        Ok((env_chain(&["GTT_USERNAME"])?, env_chain(&["GTT_PASSWORD"])?))
    }

    pub fn ibkr_login() -> Result<(String, String, String), ConfigError> {
        Ok((
            env_chain(&["IBKR_USERNAME"])?,
            env_chain(&["IBKR_PASSWORD"])?,
            env_chain(&["IBKR_ACCOUNT"])?,
        ))
    }

    pub fn tradestation_login() -> Result<(String, String, String), ConfigError> {
        Ok((
            env_chain(&["TRADESTATION_CLIENT_ID"])?,
            env_chain(&["TRADESTATION_CLIENT_SECRET"])?,
            env_chain(&["TRADESTATION_REFRESH_TOKEN"])?,
        ))
    }

    pub fn dropbox_tokens() -> Result<(String, String), ConfigError> {
        Ok((
            env_chain(&["DROPBOX_ACCESS_TOKEN"])?,
            env_chain(&["DROPBOX_REFRESH_TOKEN"])?,
        ))
    }
}

/// Connection settings for the external relational store.
///
/// The engine itself is an external collaborator; the legacy variable names are
/// kept because several deployments still export them.
#[derive(Debug, Clone)]
pub struct DatabaseEnv {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
}

impl DatabaseEnv {
    pub fn from_env() -> Self {
        Self {
            host: env_chain(&["DATABASE_HOST", "DB_HOST"]).unwrap_or_else(|_| "localhost".into()),
            port: env_chain(&["DATABASE_PORT", "DB_PORT"])
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            name: env_chain(&["DATABASE_NAME", "DB_NAME"])
                .unwrap_or_else(|_| "rlc_commodities".into()),
            user: env_chain(&["DATABASE_USER", "DB_USER"]).unwrap_or_else(|_| "postgres".into()),
            password: env_chain(&["RLC_PG_PASSWORD", "DATABASE_PASSWORD", "DB_PASSWORD"]).ok(),
        }
    }
}

// ================================================================================================
// Crop Thresholds
// ================================================================================================

/// A month/day window within the calendar year.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageWindow {
    pub start_month: u32,
    pub start_day: u32,
    pub end_month: u32,
    pub end_day: u32,
}

impl StageWindow {
    pub fn contains(&self, month: u32, day: u32) -> bool {
        (self.start_month, self.start_day) <= (month, day)
            && (month, day) <= (self.end_month, self.end_day)
    }
}

/// Agronomic thresholds for one crop. Temperatures are Celsius, precipitation
/// is millimeters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropThresholds {
    pub gdd_base_c: f64,
    pub gdd_cap_c: Option<f64>,
    pub severe_heat_threshold_c: f64,
    pub frost_threshold_c: f64,
    pub drought_threshold_mm_week: f64,
    pub excess_moisture_mm_week: f64,
    /// Stage name -> calendar window. Stage names follow agronomic usage
    /// (planting, vegetative, pollination, grain_fill, maturity, ...) and are
    /// mapped onto the five canonical growth stages by the feature engine.
    pub growth_stages: BTreeMap<String, StageWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    pub crops: BTreeMap<String, CropThresholds>,
    /// Keyword -> risk weight for World Weather email scoring.
    pub ww_risk_keywords: BTreeMap<String, f64>,
    /// Keyword -> (negative) weight for favorable-outlook scoring.
    pub ww_favorable_keywords: BTreeMap<String, f64>,
}

impl ThresholdsConfig {
    /// Look up thresholds for a crop, folding wheat variants onto `wheat`.
    pub fn for_crop(&self, crop: &str) -> Option<&CropThresholds> {
        let key = if crop.contains("wheat") { "wheat" } else { crop };
        self.crops.get(key)
    }
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        fn window(sm: u32, sd: u32, em: u32, ed: u32) -> StageWindow {
            StageWindow {
                start_month: sm,
                start_day: sd,
                end_month: em,
                end_day: ed,
            }
        }

        let mut crops = BTreeMap::new();
        crops.insert(
            "corn".to_string(),
            CropThresholds {
                gdd_base_c: 10.0,
                gdd_cap_c: Some(30.0),
                severe_heat_threshold_c: 35.0,
                frost_threshold_c: 0.0,
                drought_threshold_mm_week: 13.0,
                excess_moisture_mm_week: 75.0,
                growth_stages: BTreeMap::from([
                    ("planting".into(), window(4, 15, 5, 31)),
                    ("vegetative".into(), window(6, 1, 7, 9)),
                    ("pollination".into(), window(7, 10, 8, 10)),
                    ("grain_fill".into(), window(8, 11, 9, 15)),
                    ("maturity".into(), window(9, 16, 11, 15)),
                ]),
            },
        );
        crops.insert(
            "soybeans".to_string(),
            CropThresholds {
                gdd_base_c: 10.0,
                gdd_cap_c: Some(30.0),
                severe_heat_threshold_c: 35.0,
                frost_threshold_c: 0.0,
                drought_threshold_mm_week: 13.0,
                excess_moisture_mm_week: 75.0,
                growth_stages: BTreeMap::from([
                    ("planting".into(), window(5, 1, 6, 15)),
                    ("vegetative".into(), window(6, 16, 7, 20)),
                    ("flowering".into(), window(7, 21, 8, 20)),
                    ("seed_fill".into(), window(8, 21, 9, 20)),
                    ("maturity".into(), window(9, 21, 11, 15)),
                ]),
            },
        );
        crops.insert(
            "wheat".to_string(),
            CropThresholds {
                gdd_base_c: 4.4,
                gdd_cap_c: Some(26.0),
                severe_heat_threshold_c: 32.0,
                frost_threshold_c: -2.0,
                drought_threshold_mm_week: 10.0,
                excess_moisture_mm_week: 65.0,
                growth_stages: BTreeMap::from([
                    ("planting".into(), window(9, 15, 11, 10)),
                    ("fall_tillering".into(), window(11, 11, 12, 20)),
                    ("greenup".into(), window(3, 1, 4, 30)),
                    ("heading".into(), window(5, 1, 6, 10)),
                    ("harvest".into(), window(6, 11, 7, 31)),
                ]),
            },
        );
        crops.insert(
            "cotton".to_string(),
            CropThresholds {
                gdd_base_c: 15.6,
                gdd_cap_c: None,
                severe_heat_threshold_c: 38.0,
                frost_threshold_c: 1.0,
                drought_threshold_mm_week: 10.0,
                excess_moisture_mm_week: 90.0,
                growth_stages: BTreeMap::from([
                    ("planting".into(), window(4, 20, 6, 10)),
                    ("vegetative".into(), window(6, 11, 7, 10)),
                    ("flowering".into(), window(7, 11, 8, 25)),
                    ("grain_fill".into(), window(8, 26, 9, 30)),
                    ("harvest".into(), window(10, 1, 12, 15)),
                ]),
            },
        );

        let ww_risk_keywords = BTreeMap::from([
            ("drought".to_string(), 3.0),
            ("flooding".to_string(), 3.0),
            ("flood".to_string(), 2.0),
            ("excessive".to_string(), 2.0),
            ("stress".to_string(), 2.0),
            ("drier-bias".to_string(), 1.0),
            ("net drying".to_string(), 1.0),
            ("significant".to_string(), 1.0),
            ("severe".to_string(), 2.0),
            ("heat".to_string(), 1.0),
            ("frost".to_string(), 2.0),
            ("freeze".to_string(), 3.0),
        ]);
        let ww_favorable_keywords = BTreeMap::from([
            ("favorable".to_string(), -1.0),
            ("adequate".to_string(), -1.0),
            ("improved".to_string(), -1.0),
            ("beneficial".to_string(), -1.0),
            ("normal".to_string(), -0.5),
            ("no significant".to_string(), -0.5),
            ("unchanged".to_string(), -0.5),
        ]);

        Self {
            crops,
            ww_risk_keywords,
            ww_favorable_keywords,
        }
    }
}

// ================================================================================================
// Ensemble Weights
// ================================================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageWeights {
    pub model_a: f64,
    pub model_b: f64,
    pub model_c: f64,
}

/// Growth-stage-dependent blend weights per crop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub crops: BTreeMap<String, BTreeMap<String, StageWeights>>,
}

impl EnsembleWeights {
    /// Weights for a crop/stage, falling back to corn and then `vegetative`.
    pub fn for_crop_stage(&self, crop: &str, stage: &str) -> StageWeights {
        let fallback = StageWeights {
            model_a: 0.4,
            model_b: 0.35,
            model_c: 0.25,
        };
        let Some(table) = self.crops.get(crop).or_else(|| self.crops.get("corn")) else {
            return fallback;
        };
        table
            .get(stage)
            .or_else(|| table.get("vegetative"))
            .copied()
            .unwrap_or(fallback)
    }
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        fn w(a: f64, b: f64, c: f64) -> StageWeights {
            StageWeights {
                model_a: a,
                model_b: b,
                model_c: c,
            }
        }
        fn row_crop() -> BTreeMap<String, StageWeights> {
            BTreeMap::from([
                ("pre_planting".into(), w(0.6, 0.2, 0.2)),
                ("planting".into(), w(0.5, 0.25, 0.25)),
                ("vegetative".into(), w(0.4, 0.35, 0.25)),
                ("reproductive".into(), w(0.2, 0.5, 0.3)),
                ("maturity".into(), w(0.3, 0.4, 0.3)),
            ])
        }

        let mut crops = BTreeMap::new();
        crops.insert("corn".to_string(), row_crop());
        crops.insert("soybeans".to_string(), row_crop());

        let mut winter_wheat = row_crop();
        winter_wheat.insert("pre_planting".into(), w(0.7, 0.15, 0.15));
        winter_wheat.insert("planting".into(), w(0.6, 0.2, 0.2));
        crops.insert("winter_wheat".to_string(), winter_wheat);

        let mut cotton = row_crop();
        cotton.insert("vegetative".into(), w(0.35, 0.4, 0.25));
        crops.insert("cotton".to_string(), cotton);

        Self { crops }
    }
}

// ================================================================================================
// Country Synonyms
// ================================================================================================

/// Upstream country spellings -> ISO-3 code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountrySynonyms {
    pub map: BTreeMap<String, String>,
}

impl CountrySynonyms {
    pub fn builtin() -> Self {
        let map = BTreeMap::from(
            [
                ("brazil", "BRA"),
                ("brasil", "BRA"),
                ("argentina", "ARG"),
                ("colombia", "COL"),
                ("uruguay", "URY"),
                ("paraguay", "PRY"),
                ("united states", "USA"),
                ("united states of america", "USA"),
                ("usa", "USA"),
                ("estados unidos", "USA"),
                ("china", "CHN"),
                ("china, mainland", "CHN"),
                ("hong kong", "HKG"),
                ("mexico", "MEX"),
                ("méxico", "MEX"),
                ("japan", "JPN"),
                ("japón", "JPN"),
                ("south korea", "KOR"),
                ("korea, south", "KOR"),
                ("republic of korea", "KOR"),
                ("corea del sur", "KOR"),
                ("netherlands", "NLD"),
                ("países bajos", "NLD"),
                ("spain", "ESP"),
                ("españa", "ESP"),
                ("germany", "DEU"),
                ("alemania", "DEU"),
                ("india", "IND"),
                ("vietnam", "VNM"),
                ("viet nam", "VNM"),
                ("indonesia", "IDN"),
                ("malaysia", "MYS"),
                ("egypt", "EGY"),
                ("egipto", "EGY"),
                ("iran", "IRN"),
                ("turkey", "TUR"),
                ("türkiye", "TUR"),
                ("chile", "CHL"),
                ("peru", "PER"),
                ("perú", "PER"),
                ("venezuela", "VEN"),
                ("bolivia", "BOL"),
                ("ecuador", "ECU"),
                ("canada", "CAN"),
                ("canadá", "CAN"),
                ("united kingdom", "GBR"),
                ("reino unido", "GBR"),
                ("france", "FRA"),
                ("francia", "FRA"),
                ("italy", "ITA"),
                ("italia", "ITA"),
                ("russia", "RUS"),
                ("russian federation", "RUS"),
                ("saudi arabia", "SAU"),
                ("arabia saudita", "SAU"),
                ("united arab emirates", "ARE"),
                ("thailand", "THA"),
                ("taiwan", "TWN"),
                ("philippines", "PHL"),
                ("bangladesh", "BGD"),
                ("pakistan", "PAK"),
                ("morocco", "MAR"),
                ("algeria", "DZA"),
                ("nigeria", "NGA"),
                ("south africa", "ZAF"),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        Self { map }
    }

    /// Resolve a country string to an ISO-3 code. Already-ISO inputs pass
    /// through; unknown names return `None`.
    pub fn resolve(&self, name: &str) -> Option<String> {
        let trimmed = name.trim();
        if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_uppercase()) {
            return Some(trimmed.to_string());
        }
        self.map.get(&trimmed.to_lowercase()).cloned()
    }
}

// ================================================================================================
// Release Calendars
// ================================================================================================

/// When (and for which lagged period) a source publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseCalendar {
    pub country_code: String,
    pub release_day_of_month: u32,
    pub release_lag_months: u32,
    pub timezone: String,
    /// Day offsets to retry after a release-day miss before counting failures.
    pub retry_days: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseCalendars {
    pub calendars: BTreeMap<String, ReleaseCalendar>,
}

impl Default for ReleaseCalendars {
    fn default() -> Self {
        fn cal(code: &str, day: u32, lag: u32) -> (String, ReleaseCalendar) {
            (
                code.to_string(),
                ReleaseCalendar {
                    country_code: code.to_string(),
                    release_day_of_month: day,
                    release_lag_months: lag,
                    timezone: "America/Sao_Paulo".to_string(),
                    retry_days: vec![1, 2, 3],
                },
            )
        }
        Self {
            calendars: BTreeMap::from([
                cal("BRA", 8, 1),
                cal("ARG", 15, 1),
                cal("COL", 15, 1),
                cal("URY", 15, 1),
                cal("PRY", 20, 2),
            ]),
        }
    }
}

// ================================================================================================
// Security Patterns
// ================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedPattern {
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPatterns {
    pub blocked: Vec<BlockedPattern>,
    pub blocked_directories: Vec<String>,
    /// Task types that require at least one allowlist match.
    pub allowed: BTreeMap<String, Vec<String>>,
    /// Roots under which delete operations are permitted.
    pub deletable_roots: Vec<String>,
}

impl Default for SecurityPatterns {
    fn default() -> Self {
        fn bp(pattern: &str, reason: &str) -> BlockedPattern {
            BlockedPattern {
                pattern: pattern.to_string(),
                reason: reason.to_string(),
            }
        }
        Self {
            blocked: vec![
                bp(r"rm\s+-rf", "Recursive file deletion is prohibited"),
                bp(r"rm\s+-r\s+/", "Deleting system directories is prohibited"),
                bp(r"rmdir\s+/", "Deleting system directories is prohibited"),
                bp(r"remove_file\s*\(", "Direct file deletion is prohibited"),
                bp(r"remove_dir_all", "Recursive directory deletion is prohibited"),
                bp(r"chmod\s+777", "Insecure permissions are prohibited"),
                bp(r"chmod\s+-R", "Recursive permission changes are prohibited"),
                bp(r"chown\s+-R", "Recursive ownership changes are prohibited"),
                bp(r"/etc/passwd", "Access to system auth files is prohibited"),
                bp(r"/etc/shadow", "Access to system auth files is prohibited"),
                bp(r"/etc/sudoers", "Access to sudo config is prohibited"),
                bp(r"\.ssh/", "Access to SSH keys is prohibited"),
                bp(r"iptables", "Firewall modification is prohibited"),
                bp(r"ufw\s+", "Firewall modification is prohibited"),
                bp(r"systemctl\s+stop", "Stopping services is prohibited"),
                bp(r"systemctl\s+disable", "Disabling services is prohibited"),
                bp(r"service\s+\w+\s+stop", "Stopping services is prohibited"),
                bp(r"curl\s+.*\|\s*sh", "Piping curl to shell is prohibited"),
                bp(r"curl\s+.*\|\s*bash", "Piping curl to shell is prohibited"),
                bp(r"wget\s+.*\|\s*sh", "Piping wget to shell is prohibited"),
                bp(r"echo\s+.*password", "Echoing passwords is prohibited"),
                bp(r"echo\s+.*secret", "Echoing secrets is prohibited"),
                bp(r"echo\s+.*api.?key", "Echoing API keys is prohibited"),
                bp(r"print\s*\(.*password", "Printing passwords is prohibited"),
                bp(r";\s*DROP\s+TABLE", "SQL injection pattern detected"),
                bp(r";\s*DELETE\s+FROM", "SQL injection pattern detected"),
                bp(r"eval\s*\(", "Dynamic evaluation is prohibited"),
                bp(r"exec\s*\(", "Dynamic execution is prohibited"),
                bp(r"__import__\s*\(", "Dynamic import is prohibited"),
            ],
            blocked_directories: vec![
                "/etc".into(),
                "/usr/bin".into(),
                "/usr/sbin".into(),
                "/bin".into(),
                "/sbin".into(),
                "/boot".into(),
                "/root".into(),
                "/var/log".into(),
            ],
            allowed: BTreeMap::from([
                (
                    "data_collection".to_string(),
                    vec![
                        r"http_get\s*\(".to_string(),
                        r"http_post\s*\(".to_string(),
                        r"collector\.run".to_string(),
                        r"data/".to_string(),
                    ],
                ),
                (
                    "email".to_string(),
                    vec![r"smtp".to_string(), r"imap".to_string(), r"email\.".to_string()],
                ),
            ]),
            deletable_roots: vec!["data/".into(), "tmp/".into(), "/tmp/".into()],
        }
    }
}

// ================================================================================================
// Top-Level Config
// ================================================================================================

/// Immutable process configuration. Built once at startup and shared via `Arc`;
/// never mutated after init.
#[derive(Debug, Clone)]
pub struct Config {
    pub dirs: Dirs,
    pub thresholds: ThresholdsConfig,
    pub ensemble: EnsembleWeights,
    pub synonyms: CountrySynonyms,
    pub calendars: ReleaseCalendars,
    pub security: SecurityPatterns,
}

impl Config {
    /// Load configuration rooted at `root`. Each tuning table is read from
    /// `{root}/config/<name>.json` when present, otherwise the built-in
    /// defaults apply.
    pub fn load(root: impl AsRef<Path>) -> CropcastResult<Arc<Self>> {
        let dirs = Dirs::new(root);
        let cfg_dir = dirs.config_dir.clone();

        let config = Self {
            thresholds: read_or_default(&cfg_dir.join("weather_yield_thresholds.json"))?,
            ensemble: read_or_default(&cfg_dir.join("ensemble_weights.json"))?,
            synonyms: match read_optional::<CountrySynonyms>(&cfg_dir.join("country_synonyms.json"))?
            {
                Some(s) => s,
                None => CountrySynonyms::builtin(),
            },
            calendars: read_or_default(&cfg_dir.join("release_calendars.json"))?,
            security: read_or_default(&cfg_dir.join("security_patterns.json"))?,
            dirs,
        };
        Ok(Arc::new(config))
    }

    /// In-memory config with built-in tables, rooted at `root`. Used by tests
    /// and dry runs that never touch the config directory.
    pub fn builtin(root: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self {
            dirs: Dirs::new(root),
            thresholds: ThresholdsConfig::default(),
            ensemble: EnsembleWeights::default(),
            synonyms: CountrySynonyms::builtin(),
            calendars: ReleaseCalendars::default(),
            security: SecurityPatterns::default(),
        })
    }
}

fn read_optional<T: serde::de::DeserializeOwned>(path: &Path) -> CropcastResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.display().to_string(),
        msg: e.to_string(),
    })?;
    let value = serde_json::from_str(&text).map_err(|e| ConfigError::FileRead {
        path: path.display().to_string(),
        msg: e.to_string(),
    })?;
    Ok(Some(value))
}

fn read_or_default<T>(path: &Path) -> CropcastResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    Ok(read_optional(path)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_window_contains_bounds() {
        let w = StageWindow {
            start_month: 4,
            start_day: 15,
            end_month: 5,
            end_day: 31,
        };
        assert!(w.contains(4, 15));
        assert!(w.contains(5, 31));
        assert!(w.contains(5, 1));
        assert!(!w.contains(4, 14));
        assert!(!w.contains(6, 1));
    }

    #[test]
    fn synonyms_resolve_iso_passthrough_and_spellings() {
        let syn = CountrySynonyms::builtin();
        assert_eq!(syn.resolve("BRA").as_deref(), Some("BRA"));
        assert_eq!(syn.resolve("Brasil").as_deref(), Some("BRA"));
        assert_eq!(syn.resolve("  china, mainland ").as_deref(), Some("CHN"));
        assert_eq!(syn.resolve("Atlantis"), None);
    }

    #[test]
    fn ensemble_weights_fall_back_to_vegetative() {
        let weights = EnsembleWeights::default();
        let w = weights.for_crop_stage("corn", "reproductive");
        assert!((w.model_b - 0.5).abs() < f64::EPSILON);
        let fallback = weights.for_crop_stage("corn", "unknown_stage");
        assert!((fallback.model_a - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn wheat_variants_share_threshold_entry() {
        let t = ThresholdsConfig::default();
        assert!(t.for_crop("winter_wheat").is_some());
        assert!(t.for_crop("spring_wheat").is_some());
        let base = t.for_crop("winter_wheat").unwrap().gdd_base_c;
        assert!((base - 4.4).abs() < f64::EPSILON);
    }
}
