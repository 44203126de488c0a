// ============================================================================
// Order Admission Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("order is absent")]
    Absent,

    #[error("order_uid is empty")]
    EmptyOrderUid,

    #[error("order has no items")]
    NoItems,

    #[error("invalid delivery data: {0} is empty")]
    InvalidDelivery(&'static str),
}
