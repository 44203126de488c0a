use crate::models::Order;
use super::errors::ValidationError;

/// Check whether a candidate order may be admitted to storage.
///
/// Pure: it neither mutates the order nor fills defaults such as
/// `date_created`. `None` stands for a message that decoded to JSON `null`.
pub fn validate(order: Option<&Order>) -> Result<(), ValidationError> {
    let order = order.ok_or(ValidationError::Absent)?;

    if order.order_uid.is_empty() {
        return Err(ValidationError::EmptyOrderUid);
    }
    if order.items.is_empty() {
        return Err(ValidationError::NoItems);
    }
    if order.delivery.name.is_empty() {
        return Err(ValidationError::InvalidDelivery("name"));
    }
    if order.delivery.phone.is_empty() {
        return Err(ValidationError::InvalidDelivery("phone"));
    }

    Ok(())
}

impl Order {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate(Some(self))
    }
}
