//! Integer cost arithmetic.
//!
//! Configured prices are f64 USD per million tokens; they are converted once
//! at registry build into integer micro-USD per million tokens and all
//! request costing happens in integers from there. Per-component ceiling
//! division: a request is never billed below its true price.

use crate::config::PricingConfig;
use crate::error::SwitchboardError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PricingRates {
    pub currency: String,
    pub input_usd_micros_per_million: u64,
    pub output_usd_micros_per_million: u64,
}

impl PricingRates {
    pub fn from_config(config: &PricingConfig) -> Result<Self, SwitchboardError> {
        Ok(Self {
            currency: config.currency.clone(),
            input_usd_micros_per_million: usd_per_million_to_micros(
                config.input_usd_per_million,
                "input_usd_per_million",
            )?,
            output_usd_micros_per_million: usd_per_million_to_micros(
                config.output_usd_per_million,
                "output_usd_per_million",
            )?,
        })
    }

    /// Cost of a completed request in micro-USD, ceiling per component.
    pub fn cost_usd_micros(&self, input_tokens: u64, output_tokens: u64) -> u64 {
        let input = mul_div_ceil(input_tokens, self.input_usd_micros_per_million);
        let output = mul_div_ceil(output_tokens, self.output_usd_micros_per_million);
        input.saturating_add(output)
    }

    fn max_usd_micros_per_million(&self) -> u64 {
        self.input_usd_micros_per_million
            .max(self.output_usd_micros_per_million)
    }

    /// Token count whose cost reaches `cost_usd_micros` at this provider's
    /// most expensive rate. Used to turn cost limits into total-token rules;
    /// the max rate keeps the derived limit conservative. `None` when no
    /// price is configured, in which case the limit cannot be derived.
    pub fn tokens_for_cost_usd_micros(&self, cost_usd_micros: u64) -> Option<u64> {
        let rate = self.max_usd_micros_per_million();
        if rate == 0 {
            return None;
        }
        let tokens = (u128::from(cost_usd_micros) * 1_000_000).div_ceil(u128::from(rate));
        Some(u64::try_from(tokens).unwrap_or(u64::MAX))
    }
}

fn usd_per_million_to_micros(usd: f64, field: &'static str) -> Result<u64, SwitchboardError> {
    if !usd.is_finite() || usd < 0.0 {
        return Err(SwitchboardError::Config(format!(
            "invalid price for {field}: {usd}"
        )));
    }
    let micros = (usd * 1_000_000.0).round();
    if micros > u64::MAX as f64 {
        return Err(SwitchboardError::Config(format!(
            "price for {field} out of range: {usd}"
        )));
    }
    Ok(micros as u64)
}

fn mul_div_ceil(tokens: u64, usd_micros_per_million: u64) -> u64 {
    let product = u128::from(tokens) * u128::from(usd_micros_per_million);
    u64::try_from(product.div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates(input_usd: f64, output_usd: f64) -> PricingRates {
        PricingRates::from_config(&PricingConfig {
            currency: "usd".to_string(),
            input_usd_per_million: input_usd,
            output_usd_per_million: output_usd,
        })
        .expect("rates")
    }

    #[test]
    fn converts_usd_per_million_to_micros() {
        let rates = rates(3.0, 15.0);
        assert_eq!(rates.input_usd_micros_per_million, 3_000_000);
        assert_eq!(rates.output_usd_micros_per_million, 15_000_000);
    }

    #[test]
    fn sub_dollar_prices_keep_precision() {
        // $0.25 per million input tokens.
        let rates = rates(0.25, 0.0);
        assert_eq!(rates.input_usd_micros_per_million, 250_000);
        // 100 tokens cost ceil(100 * 250000 / 1e6) = 25 micro-USD.
        assert_eq!(rates.cost_usd_micros(100, 0), 25);
        // 1 token rounds up to 1 micro-USD rather than to zero.
        assert_eq!(rates.cost_usd_micros(1, 0), 1);
    }

    #[test]
    fn cost_sums_input_and_output_components() {
        let rates = rates(3.0, 15.0);
        // 1000 in + 200 out = 3000 + 3000 micro-USD.
        assert_eq!(rates.cost_usd_micros(1_000, 200), 6_000);
    }

    #[test]
    fn derived_token_limit_uses_the_expensive_rate_and_rounds_up() {
        let rates = rates(3.0, 15.0);
        // $1.00 at $15/M tokens => ceil(1e6 * 1e6 / 15e6) = 66667 tokens.
        assert_eq!(rates.tokens_for_cost_usd_micros(1_000_000), Some(66_667));
    }

    #[test]
    fn zero_priced_provider_cannot_derive_cost_limits() {
        assert_eq!(rates(0.0, 0.0).tokens_for_cost_usd_micros(500), None);
    }

    #[test]
    fn negative_or_nan_prices_are_rejected() {
        let bad = PricingConfig {
            currency: "usd".to_string(),
            input_usd_per_million: -1.0,
            output_usd_per_million: 1.0,
        };
        assert!(PricingRates::from_config(&bad).is_err());
    }
}
