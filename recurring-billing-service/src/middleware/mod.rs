pub mod body;
pub mod tenant;

pub use body::OptionalJson;
pub use tenant::{TenantContext, TENANT_HEADER};
