use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// US states carrying NASS yield series, abbreviation to full name.
pub const US_STATES: [(&str, &str); 41] = [
    ("AL", "Alabama"),
    ("AR", "Arkansas"),
    ("AZ", "Arizona"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DE", "Delaware"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("IA", "Iowa"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("MD", "Maryland"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MO", "Missouri"),
    ("MS", "Mississippi"),
    ("MT", "Montana"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("NE", "Nebraska"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NY", "New York"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("VA", "Virginia"),
    ("WA", "Washington"),
    ("WI", "Wisconsin"),
    ("WV", "West Virginia"),
    ("WY", "Wyoming"),
];

pub fn state_full_name(abbrev: &str) -> Option<&'static str> {
    US_STATES
        .iter()
        .find(|(a, _)| *a == abbrev.to_uppercase())
        .map(|(_, full)| *full)
}

pub fn state_abbrev(name: &str) -> Option<&'static str> {
    let upper = name.to_uppercase();
    US_STATES
        .iter()
        .find(|(a, full)| *a == upper || full.to_uppercase() == upper)
        .map(|(a, _)| *a)
}

// ================================================================================================
// Crops & Stages
// ================================================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Crop {
    Corn,
    Soybeans,
    WinterWheat,
    Cotton,
}

impl Crop {
    /// Commodity name as NASS publishes it.
    pub fn nass_commodity(&self) -> &'static str {
        match self {
            Crop::Corn => "CORN",
            Crop::Soybeans => "SOYBEANS",
            Crop::WinterWheat => "WHEAT_ALL",
            Crop::Cotton => "COTTON",
        }
    }

    /// Name used by the CPC gridded tables.
    pub fn cpc_name(&self) -> String {
        self.to_string()
    }
}

/// The five canonical growth stages driving ensemble weights.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GrowthStage {
    PrePlanting,
    Planting,
    Vegetative,
    Reproductive,
    Maturity,
}

impl GrowthStage {
    /// Fold an agronomic stage name from the thresholds config onto the
    /// canonical five.
    pub fn from_config_stage(name: &str) -> Option<Self> {
        match name {
            "planting" | "emergence" => Some(Self::Planting),
            "vegetative" | "fall_tillering" | "greenup" => Some(Self::Vegetative),
            "pollination" | "flowering" | "heading" | "seed_fill" | "grain_fill" => {
                Some(Self::Reproductive)
            }
            "maturity" | "harvest" | "dormancy" => Some(Self::Maturity),
            "pre_planting" => Some(Self::PrePlanting),
            _ => None,
        }
    }

    /// Coarse default when no configured window matches.
    pub fn from_month(month: u32) -> Self {
        match month {
            1..=4 => Self::PrePlanting,
            5..=6 => Self::Vegetative,
            7..=8 => Self::Reproductive,
            _ => Self::Maturity,
        }
    }
}

// ================================================================================================
// NASS Week Calendar
// ================================================================================================

/// Convert a NASS crop-progress week number to its approximate week-ending
/// date (a Sunday). NASS week 1 is roughly ISO week 14 (early April).
pub fn nass_week_to_date(year: i32, week: u32) -> NaiveDate {
    let iso_week = (week + 13).min(52);
    let jan1 = NaiveDate::from_ymd_opt(year, 1, 1).expect("January 1st always exists");
    let target = jan1 + chrono::Duration::weeks(iso_week as i64 - 1);
    let days_to_sunday = (6 - target.weekday().num_days_from_monday() as i64).rem_euclid(7);
    target + chrono::Duration::days(days_to_sunday)
}

/// Inverse mapping: date to NASS week, clamped to [1, 40].
pub fn date_to_nass_week(date: NaiveDate) -> u32 {
    let iso_week = date.iso_week().week() as i32;
    (iso_week - 13).clamp(1, 40) as u32
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;

    #[test]
    fn nass_week_dates_land_on_sunday() {
        for week in [1, 10, 20, 30, 40] {
            let date = nass_week_to_date(2024, week);
            assert_eq!(date.weekday(), Weekday::Sun, "week {week} -> {date}");
        }
    }

    #[test]
    fn nass_week_round_trips_in_season() {
        for week in 5..=35 {
            let date = nass_week_to_date(2024, week);
            let back = date_to_nass_week(date);
            assert!(
                (back as i64 - week as i64).abs() <= 1,
                "week {week} -> {date} -> {back}"
            );
        }
    }

    #[test]
    fn week_one_is_early_april() {
        let date = nass_week_to_date(2024, 1);
        assert_eq!(date.month(), 4);
    }

    #[test]
    fn state_lookup_both_directions() {
        assert_eq!(state_full_name("ia"), Some("Iowa"));
        assert_eq!(state_abbrev("Iowa"), Some("IA"));
        assert_eq!(state_abbrev("IA"), Some("IA"));
        assert_eq!(state_abbrev("Atlantis"), None);
    }

    #[test]
    fn crop_names_for_upstream_systems() {
        assert_eq!(Crop::WinterWheat.nass_commodity(), "WHEAT_ALL");
        assert_eq!(Crop::WinterWheat.to_string(), "winter_wheat");
        assert_eq!(Crop::Corn.cpc_name(), "corn");
    }

    #[test]
    fn stage_mapping_folds_config_names() {
        assert_eq!(
            GrowthStage::from_config_stage("pollination"),
            Some(GrowthStage::Reproductive)
        );
        assert_eq!(
            GrowthStage::from_config_stage("greenup"),
            Some(GrowthStage::Vegetative)
        );
        assert_eq!(GrowthStage::from_config_stage("unknown"), None);
        assert_eq!(GrowthStage::from_month(3), GrowthStage::PrePlanting);
        assert_eq!(GrowthStage::from_month(8), GrowthStage::Reproductive);
    }
}
