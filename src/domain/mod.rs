// ============================================================================
// Domain Layer - Admission Rules
// ============================================================================
//
// The order aggregate itself lives in `crate::models` because the stream, the
// store and the cache all share it. This layer holds the rules a candidate
// order must satisfy before it is admitted to storage.
//
// ============================================================================

pub mod order;
