// ============================================================================
// Order Domain - Validation of Candidate Orders
// ============================================================================
//
// - Errors (ValidationError enum)
// - Validator (pure admission check)
//
// ============================================================================

pub mod errors;
pub mod validator;

pub use errors::*;
pub use validator::*;
