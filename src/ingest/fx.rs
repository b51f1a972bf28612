//! Static currency conversion table.
//!
//! Rates are indicative mid-market values compiled in at build time; the
//! registry-refresh story is an operational concern, not the core's. Unknown
//! currencies reject the event at validation.

/// USD per one unit of the given currency.
pub fn usd_rate(currency: &str) -> Option<f64> {
    let rate = match currency {
        "USD" => 1.0,
        "MXN" => 0.058,
        "COP" => 0.00025,
        "BRL" => 0.19,
        "ARS" => 0.0011,
        "CLP" => 0.0011,
        "PEN" => 0.27,
        "EUR" => 1.09,
        "GBP" => 1.27,
        _ => return None,
    };
    Some(rate)
}

/// Convert an amount to USD; None when the currency is unknown.
pub fn convert_to_usd(value: f64, currency: &str) -> Option<f64> {
    usd_rate(currency).map(|rate| value * rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usd_is_identity() {
        assert_eq!(convert_to_usd(100.0, "USD"), Some(100.0));
    }

    #[test]
    fn test_known_latam_currencies() {
        for ccy in ["MXN", "COP", "BRL"] {
            let converted = convert_to_usd(1000.0, ccy).unwrap();
            assert!(converted > 0.0 && converted < 1000.0, "{ccy} => {converted}");
        }
    }

    #[test]
    fn test_unknown_currency_is_none() {
        assert_eq!(convert_to_usd(10.0, "DOGE"), None);
    }
}
