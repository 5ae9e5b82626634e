// =============================================================================
// HTTP API surface — webhook ingress plus operational health endpoints
// =============================================================================

pub mod webhook;
