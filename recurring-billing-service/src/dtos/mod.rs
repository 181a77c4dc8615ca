pub mod billing;

pub use billing::{
    ChangePlanRequest, EffectiveDateRequest, PayInvoiceRequest, ReactivateRequest,
    ReprocessRequest, MAX_REPROCESS_BATCH,
};
