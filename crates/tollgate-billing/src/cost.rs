use rust_decimal::{Decimal, RoundingStrategy};

/// Fractional digits kept on every ledger amount
pub const AMOUNT_SCALE: u32 = 6;

/// Smallest chargeable amount, 0.000001
pub const MIN_CHARGE: Decimal = Decimal::from_parts(1, 0, 0, false, AMOUNT_SCALE);

/// Round an exact cost to a ledger amount
///
/// Non-positive costs are zero. Any positive cost rounds up to six fractional
/// digits, so positive consumption is never free.
pub fn round_cost(exact: Decimal) -> Decimal {
    if exact <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    if exact < MIN_CHARGE {
        return MIN_CHARGE;
    }

    exact.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::AwayFromZero)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn tiny_costs_round_to_minimum() {
        assert_eq!(round_cost(dec("0.0000000001")), dec("0.000001"));
        assert_eq!(round_cost(dec("0.0000009999")), dec("0.000001"));
    }

    #[test]
    fn rounds_up_at_six_digits() {
        assert_eq!(round_cost(dec("0.0000010001")), dec("0.000002"));
        assert_eq!(round_cost(dec("3.0000001")), dec("3.000001"));
        assert_eq!(round_cost(dec("4.4")), dec("4.4"));
    }

    #[test]
    fn zero_and_negative_are_free() {
        assert_eq!(round_cost(Decimal::ZERO), Decimal::ZERO);
        assert_eq!(round_cost(dec("-1")), Decimal::ZERO);
    }

    #[test]
    fn scale_is_capped() {
        let rounded = round_cost(dec("1.123456789"));
        assert_eq!(rounded, dec("1.123457"));
        assert!(rounded.scale() <= AMOUNT_SCALE);
    }
}
