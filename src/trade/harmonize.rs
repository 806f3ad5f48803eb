use crate::{
    config::CountrySynonyms,
    error::TradeError,
    trade::record::{Flow, TradeRecord},
};

/// Bushels per metric ton, by commodity.
const BUSHEL_FACTORS: [(&str, f64); 4] = [
    ("corn", 39.368),
    ("soybeans", 36.744),
    ("soy", 36.744),
    ("wheat", 36.744),
];

/// Normalizes per-country trade records into the comparable silver form:
/// canonical HS stems, ISO-3 partners, metric tons, flow-appropriate USD
/// valuation.
pub struct Harmonizer {
    synonyms: CountrySynonyms,
}

impl Harmonizer {
    pub fn new(synonyms: CountrySynonyms) -> Self {
        Self { synonyms }
    }

    /// Strip separators from a national commodity code and derive the level
    /// and 6-digit canonical stem.
    pub fn normalize_hs_code(raw: &str) -> Result<(String, u8, Option<String>), TradeError> {
        let code: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if code.is_empty() || code.len() > 10 {
            return Err(TradeError::InvalidHsCode(raw.to_string()));
        }
        let level = code.len() as u8;
        let hs6 = if code.len() >= 6 {
            Some(code[..6].to_string())
        } else {
            None
        };
        Ok((code, level, hs6))
    }

    /// Convert a quantity to metric tons. Bushels need a commodity context.
    pub fn convert_to_tons(
        value: f64,
        unit: &str,
        commodity: Option<&str>,
    ) -> Result<f64, TradeError> {
        match unit.trim().to_lowercase().as_str() {
            "kg" | "kilograms" => Ok(value * 1e-3),
            "mt" | "t" | "tons" | "tonnes" | "metric tons" => Ok(value),
            "thousand mt" | "1000 mt" | "kmt" => Ok(value * 1e3),
            "mmt" | "million mt" => Ok(value * 1e6),
            "bu" | "bushel" | "bushels" => {
                let commodity = commodity
                    .ok_or_else(|| TradeError::NoBushelFactor("<unspecified>".to_string()))?;
                let key = commodity.to_lowercase();
                let factor = BUSHEL_FACTORS
                    .iter()
                    .find(|(name, _)| key.contains(name))
                    .map(|(_, f)| *f)
                    .ok_or_else(|| TradeError::NoBushelFactor(commodity.to_string()))?;
                Ok(value / factor)
            }
            other => Err(TradeError::UnknownUnit(other.to_string())),
        }
    }

    /// Convert metric tons back to bushels for a commodity.
    pub fn tons_to_bushels(tons: f64, commodity: &str) -> Result<f64, TradeError> {
        let key = commodity.to_lowercase();
        BUSHEL_FACTORS
            .iter()
            .find(|(name, _)| key.contains(name))
            .map(|(_, factor)| tons * factor)
            .ok_or_else(|| TradeError::NoBushelFactor(commodity.to_string()))
    }

    pub fn resolve_country(&self, name: &str) -> Option<String> {
        self.synonyms.resolve(name)
    }

    /// Harmonize one record in place. Unresolvable partner names are kept
    /// (uppercased) and reported as a warning rather than dropped.
    pub fn harmonize(&self, record: &mut TradeRecord) -> Result<Vec<String>, TradeError> {
        let mut warnings = Vec::new();

        let (code, level, hs6) = Self::normalize_hs_code(&record.hs_code)?;
        record.hs_code = code;
        record.hs_level = level;
        record.hs_code_6 = hs6;

        match self.resolve_country(&record.partner_country) {
            Some(iso3) => record.partner_country = iso3,
            None => {
                warnings.push(format!(
                    "unresolved partner country '{}'",
                    record.partner_country
                ));
                record.partner_country = record.partner_country.trim().to_uppercase();
            }
        }

        if record.quantity_tons.is_none() {
            record.quantity_tons = record.quantity_kg.map(|kg| kg * 1e-3);
        }

        record.value_usd = match record.flow {
            Flow::Export => record.value_fob_usd.unwrap_or(record.value_usd),
            Flow::Import => record
                .value_cif_usd
                .or(record.value_fob_usd)
                .unwrap_or(record.value_usd),
        };

        Ok(warnings)
    }

    /// Harmonize a batch, dropping records with invalid codes and collecting
    /// warnings. Returns `(harmonized, warnings)`.
    pub fn harmonize_records(
        &self,
        records: Vec<TradeRecord>,
    ) -> (Vec<TradeRecord>, Vec<String>) {
        let mut harmonized = Vec::with_capacity(records.len());
        let mut warnings = Vec::new();

        for mut record in records {
            match self.harmonize(&mut record) {
                Ok(mut record_warnings) => {
                    warnings.append(&mut record_warnings);
                    harmonized.push(record);
                }
                Err(e) => warnings.push(format!(
                    "dropped record ({} {} {}): {e}",
                    record.reporter_country, record.period, record.flow
                )),
            }
        }
        (harmonized, warnings)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn sample_record() -> TradeRecord {
        TradeRecord {
            data_source: "COMEX_STAT".into(),
            reporter_country: "BRA".into(),
            flow: Flow::Export,
            year: 2024,
            month: 8,
            period: "2024-08".into(),
            hs_code: "10.05.90.10".into(),
            hs_level: 0,
            hs_code_6: None,
            partner_country: "China".into(),
            quantity_kg: Some(1_000_000.0),
            quantity_tons: None,
            value_usd: 0.0,
            value_fob_usd: Some(250_000.0),
            value_cif_usd: None,
            hs_description: None,
            state_region: None,
            customs_office: None,
            provisional: false,
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn harmonizes_hs_quantity_and_value() {
        let harmonizer = Harmonizer::new(CountrySynonyms::builtin());
        let mut record = sample_record();
        let warnings = harmonizer.harmonize(&mut record).unwrap();

        assert!(warnings.is_empty());
        assert_eq!(record.hs_code, "10059010");
        assert_eq!(record.hs_level, 8);
        assert_eq!(record.hs_code_6.as_deref(), Some("100590"));
        assert_eq!(record.partner_country, "CHN");
        assert_eq!(record.quantity_tons, Some(1000.0));
        assert!((record.value_usd - 250_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn import_prefers_cif_with_fob_fallback() {
        let harmonizer = Harmonizer::new(CountrySynonyms::builtin());

        let mut with_cif = sample_record();
        with_cif.flow = Flow::Import;
        with_cif.value_cif_usd = Some(260_000.0);
        harmonizer.harmonize(&mut with_cif).unwrap();
        assert!((with_cif.value_usd - 260_000.0).abs() < f64::EPSILON);

        let mut without_cif = sample_record();
        without_cif.flow = Flow::Import;
        harmonizer.harmonize(&mut without_cif).unwrap();
        assert!((without_cif.value_usd - 250_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn short_codes_have_no_hs6() {
        let (code, level, hs6) = Harmonizer::normalize_hs_code("1005").unwrap();
        assert_eq!(code, "1005");
        assert_eq!(level, 4);
        assert_eq!(hs6, None);
        assert!(Harmonizer::normalize_hs_code("not-a-code").is_err());
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(Harmonizer::convert_to_tons(1500.0, "kg", None).unwrap(), 1.5);
        assert_eq!(Harmonizer::convert_to_tons(2.0, "mt", None).unwrap(), 2.0);
        assert_eq!(Harmonizer::convert_to_tons(3.0, "thousand mt", None).unwrap(), 3000.0);
        assert_eq!(Harmonizer::convert_to_tons(1.0, "mmt", None).unwrap(), 1_000_000.0);
        assert!(Harmonizer::convert_to_tons(1.0, "furlongs", None).is_err());
    }

    #[test]
    fn bushel_round_trip_within_one_ppm() {
        for commodity in ["corn", "soybeans", "wheat"] {
            let bushels = 10_000.0;
            let tons = Harmonizer::convert_to_tons(bushels, "bu", Some(commodity)).unwrap();
            let back = Harmonizer::tons_to_bushels(tons, commodity).unwrap();
            assert!(
                ((back - bushels) / bushels).abs() < 1e-6,
                "{commodity}: {back} != {bushels}"
            );
        }
        assert!(Harmonizer::convert_to_tons(1.0, "bu", Some("quinoa")).is_err());
        assert!(Harmonizer::convert_to_tons(1.0, "bu", None).is_err());
    }
}
