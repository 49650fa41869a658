//! Regime polarity and fractal confluence.
//!
//! Regime ids come from the external classifier and are opaque here; the
//! configured lists say which ids read as bullish, bearish or lateral.

use serde::Serialize;

use crate::state::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimePolarity {
    Bullish,
    Bearish,
    Lateral,
    /// Not in any configured list.
    Undetermined,
}

#[derive(Debug, Clone, Default)]
pub struct RegimeMap {
    bullish: Vec<String>,
    bearish: Vec<String>,
    lateral: Vec<String>,
}

impl RegimeMap {
    pub fn new(bullish: Vec<String>, bearish: Vec<String>, lateral: Vec<String>) -> Self {
        Self { bullish, bearish, lateral }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.bullish_regimes.clone(),
            cfg.bearish_regimes.clone(),
            cfg.lateral_regimes.clone(),
        )
    }

    pub fn polarity(&self, regime: &str) -> RegimePolarity {
        // Lateral wins if an id is listed twice.
        if self.lateral.iter().any(|r| r == regime) {
            RegimePolarity::Lateral
        } else if self.bullish.iter().any(|r| r == regime) {
            RegimePolarity::Bullish
        } else if self.bearish.iter().any(|r| r == regime) {
            RegimePolarity::Bearish
        } else {
            RegimePolarity::Undetermined
        }
    }

    /// True when the higher timeframe agrees with the operational one.
    ///
    /// Without a secondary regime there is nothing to disagree with. With one,
    /// both must share a bullish or bearish polarity; lateral or unknown ids
    /// never agree.
    pub fn confluence(&self, primary: &str, secondary: Option<&str>) -> bool {
        let Some(secondary) = secondary else {
            return true;
        };
        matches!(
            (self.polarity(primary), self.polarity(secondary)),
            (RegimePolarity::Bullish, RegimePolarity::Bullish)
                | (RegimePolarity::Bearish, RegimePolarity::Bearish)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> RegimeMap {
        RegimeMap::from_config(&Config::default())
    }

    #[test]
    fn test_default_polarities() {
        let m = map();
        assert_eq!(m.polarity("5"), RegimePolarity::Bullish);
        assert_eq!(m.polarity("6"), RegimePolarity::Bearish);
        assert_eq!(m.polarity("0"), RegimePolarity::Lateral);
        assert_eq!(m.polarity("3"), RegimePolarity::Undetermined);
    }

    #[test]
    fn test_confluence() {
        let m = map();
        assert!(m.confluence("5", None));
        assert!(m.confluence("0", None));
        assert!(m.confluence("5", Some("5")));
        assert!(m.confluence("6", Some("6")));
        assert!(!m.confluence("5", Some("6")));
        assert!(!m.confluence("0", Some("0")));
        assert!(!m.confluence("5", Some("0")));
        assert!(!m.confluence("3", Some("3")));
    }

    #[test]
    fn test_multiple_ids_per_polarity() {
        let m = RegimeMap::new(
            vec!["1".into(), "5".into()],
            vec!["6".into()],
            vec!["0".into()],
        );
        assert!(m.confluence("1", Some("5")));
    }
}
