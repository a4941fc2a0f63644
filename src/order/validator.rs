//! Pre-trade order validation and quantity adjustment

use crate::errors::ValidationError;

/// Validates and down-sizes order quantities before submission: margin
/// sufficiency for opens, held position for closes, contract lot size, and
/// the post-trade margin ratio.
#[derive(Debug, Clone)]
pub struct OrderValidator {
    /// Minimum precision tolerance
    tolerance: f64,
    /// Fraction below which a shortfall fails early instead of down-sizing
    threshold_ratio: f64,
    /// Floor on the post-trade margin ratio
    maintenance_margin_rate: f64,
    /// Smallest tradable contract quantity
    min_contract_size: f64,
}

impl Default for OrderValidator {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            threshold_ratio: 0.5,
            maintenance_margin_rate: 0.005,
            min_contract_size: 0.001,
        }
    }
}

impl OrderValidator {
    pub fn new(
        tolerance: f64,
        threshold_ratio: f64,
        maintenance_margin_rate: f64,
        min_contract_size: f64,
    ) -> Self {
        Self {
            tolerance,
            threshold_ratio,
            maintenance_margin_rate,
            min_contract_size,
        }
    }

    /// Validate an opening order, down-sizing it to the available margin
    /// when possible. Returns the adjusted quantity.
    pub fn validate_open(
        &self,
        margin_balance: f64,
        quantity: f64,
        price: f64,
        leverage: f64,
    ) -> Result<f64, ValidationError> {
        let required_margin = quantity * price / leverage;
        if margin_balance < required_margin * self.threshold_ratio {
            return Err(ValidationError::InsufficientMargin {
                required: required_margin,
                available: margin_balance,
            });
        }

        let adjusted = if required_margin > margin_balance {
            let adjusted = ((margin_balance - self.tolerance) * leverage / price).max(0.0);
            if adjusted <= 0.0 || (adjusted * price / leverage) < self.tolerance {
                return Err(ValidationError::InsufficientMargin {
                    required: required_margin,
                    available: margin_balance,
                });
            }
            adjusted
        } else {
            quantity
        };

        self.check_contract_quantity(adjusted)?;
        self.check_margin_ratio(margin_balance, adjusted, price, leverage)?;
        Ok(adjusted)
    }

    /// Validate a closing order against the held position. Returns the
    /// adjusted quantity.
    pub fn validate_close(
        &self,
        position_quantity: f64,
        quantity: f64,
    ) -> Result<f64, ValidationError> {
        if position_quantity < quantity * self.threshold_ratio {
            return Err(ValidationError::InsufficientPosition {
                held: position_quantity,
                requested: quantity,
            });
        }

        let adjusted = quantity.min(position_quantity - self.tolerance);
        self.check_contract_quantity(adjusted)?;
        Ok(adjusted)
    }

    fn check_contract_quantity(&self, quantity: f64) -> Result<(), ValidationError> {
        if quantity <= 0.0 || quantity < self.min_contract_size {
            return Err(ValidationError::InvalidContractQuantity {
                quantity,
                min_contract_size: self.min_contract_size,
            });
        }
        Ok(())
    }

    fn check_margin_ratio(
        &self,
        margin_balance: f64,
        quantity: f64,
        price: f64,
        leverage: f64,
    ) -> Result<(), ValidationError> {
        let position_value = quantity * price;
        let margin_ratio = margin_balance / (position_value / leverage);
        if margin_ratio < self.maintenance_margin_rate {
            return Err(ValidationError::MarginRatio {
                ratio: margin_ratio,
                maintenance_rate: self.maintenance_margin_rate,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_passes_with_ample_margin() {
        let v = OrderValidator::default();
        // 1 contract at 100 with 10x leverage needs 10 margin
        let qty = v.validate_open(1000.0, 1.0, 100.0, 10.0).unwrap();
        assert!((qty - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_open_fails_far_below_threshold() {
        let v = OrderValidator::default();
        // Required margin 100, available 40 < 100 * 0.5
        let err = v.validate_open(40.0, 10.0, 100.0, 10.0).unwrap_err();
        assert!(matches!(err, ValidationError::InsufficientMargin { .. }));
    }

    #[test]
    fn test_open_downsizes_to_available_margin() {
        let v = OrderValidator::default();
        // Required margin 100, available 80: quantity scales to ~8
        let qty = v.validate_open(80.0, 10.0, 100.0, 10.0).unwrap();
        assert!(qty < 10.0);
        assert!((qty - 8.0).abs() < 1e-3);
        // The adjusted order actually fits the margin
        assert!(qty * 100.0 / 10.0 <= 80.0);
    }

    #[test]
    fn test_open_rejects_dust_quantity() {
        let v = OrderValidator::default();
        let err = v.validate_open(1000.0, 0.0001, 100.0, 10.0).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidContractQuantity { .. }));
    }

    #[test]
    fn test_open_margin_ratio_floor() {
        let v = OrderValidator::new(1e-6, 0.0, 0.5, 0.001);
        // Post-trade margin ratio = 100 / (10*100/10) = 1.0, passes a 0.5 floor
        assert!(v.validate_open(100.0, 10.0, 100.0, 10.0).is_ok());

        // Floor above any achievable ratio fails
        let v = OrderValidator::new(1e-6, 0.0, 2.0, 0.001);
        let err = v.validate_open(100.0, 10.0, 100.0, 10.0).unwrap_err();
        assert!(matches!(err, ValidationError::MarginRatio { .. }));
    }

    #[test]
    fn test_close_clamps_to_position() {
        let v = OrderValidator::default();
        let qty = v.validate_close(2.0, 3.0).unwrap();
        assert!(qty <= 2.0);
        assert!((qty - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_close_fails_without_position() {
        let v = OrderValidator::default();
        let err = v.validate_close(0.4, 1.0).unwrap_err();
        assert!(matches!(err, ValidationError::InsufficientPosition { .. }));
    }

    #[test]
    fn test_close_exact_position() {
        let v = OrderValidator::default();
        let qty = v.validate_close(1.0, 1.0).unwrap();
        assert!(qty > 0.999 && qty <= 1.0);
    }
}
