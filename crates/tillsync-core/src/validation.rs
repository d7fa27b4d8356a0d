//! Checks applied to a sale before its transaction opens.
//!
//! SQLite's CHECK and foreign key constraints remain the last line; these
//! functions exist so a bad sale fails with a readable reason and without
//! touching the Local Store.

use crate::error::ValidationError;
use crate::types::{NewSale, PaymentMethod};
use crate::{MAX_ITEM_QUANTITY, MAX_SALE_LINES};

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates the shape of a sale.
///
/// Whether cash covers the total depends on prices read inside the
/// transaction, so the Local Store follows up with [`validate_tendered`].
pub fn validate_new_sale(sale: &NewSale) -> ValidationResult<()> {
    if sale.cashier_id.trim().is_empty() {
        return Err(ValidationError::Required { field: "cashier_id" });
    }
    if sale.lines.is_empty() {
        return Err(ValidationError::Required { field: "lines" });
    }
    if sale.lines.len() > MAX_SALE_LINES {
        return Err(ValidationError::OutOfRange {
            field: "lines",
            min: 1,
            max: MAX_SALE_LINES as i64,
        });
    }

    for line in &sale.lines {
        if line.product_id.trim().is_empty() {
            return Err(ValidationError::Required { field: "product_id" });
        }
        if !(1..=MAX_ITEM_QUANTITY).contains(&line.quantity) {
            return Err(ValidationError::OutOfRange {
                field: "quantity",
                min: 1,
                max: MAX_ITEM_QUANTITY,
            });
        }
    }

    if sale.discount_cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: "discount",
            min: 0,
            max: i64::MAX,
        });
    }

    match (sale.payment_method, sale.amount_tendered_cents) {
        (PaymentMethod::Cash, None) => Err(ValidationError::Required {
            field: "amount_tendered",
        }),
        (_, Some(cents)) if cents <= 0 => Err(ValidationError::MustBePositive {
            field: "amount_tendered",
        }),
        _ => Ok(()),
    }
}

/// Checks that the cash handed over covers `total_cents`.
pub fn validate_tendered(total_cents: i64, tendered_cents: i64) -> ValidationResult<()> {
    if tendered_cents < total_cents {
        return Err(ValidationError::OutOfRange {
            field: "amount_tendered",
            min: total_cents,
            max: i64::MAX,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewSaleLine;

    fn cash_sale(quantity: i64, tendered: Option<i64>) -> NewSale {
        NewSale {
            cashier_id: "cashier-1".into(),
            lines: vec![NewSaleLine {
                product_id: "p-1".into(),
                quantity,
            }],
            payment_method: PaymentMethod::Cash,
            amount_tendered_cents: tendered,
            discount_cents: 0,
        }
    }

    #[test]
    fn test_quantity_bounds() {
        assert!(validate_new_sale(&cash_sale(1, Some(2000))).is_ok());
        assert!(validate_new_sale(&cash_sale(MAX_ITEM_QUANTITY, Some(2000))).is_ok());
        assert!(validate_new_sale(&cash_sale(0, Some(2000))).is_err());
        assert!(validate_new_sale(&cash_sale(MAX_ITEM_QUANTITY + 1, Some(2000))).is_err());
    }

    #[test]
    fn test_cash_requires_tendered_but_card_does_not() {
        assert_eq!(
            validate_new_sale(&cash_sale(1, None)),
            Err(ValidationError::Required {
                field: "amount_tendered"
            })
        );

        let mut card = cash_sale(1, None);
        card.payment_method = PaymentMethod::Card;
        assert!(validate_new_sale(&card).is_ok());
    }

    #[test]
    fn test_empty_sale_rejected() {
        let mut empty = cash_sale(1, Some(2000));
        empty.lines.clear();
        assert!(validate_new_sale(&empty).is_err());
    }

    #[test]
    fn test_tendered_must_cover_total() {
        assert!(validate_tendered(1599, 2000).is_ok());
        assert!(validate_tendered(1599, 1599).is_ok());
        assert!(validate_tendered(1599, 1000).is_err());
    }
}
