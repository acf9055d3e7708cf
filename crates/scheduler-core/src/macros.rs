//! Macros for reducing job-payload boilerplate.

/// Auto-implement [`crate::model::IntoPayload::into_payload`] for a type that
/// derives `Serialize`.
///
/// Use this inside an `IntoPayload` impl block as a one-liner replacement for
/// manual `serde_json::to_value` boilerplate.
///
/// # Example
///
/// ```ignore
/// use scheduler_core::{auto_payload, model::IntoPayload};
/// use serde::Serialize;
///
/// #[derive(Debug, Clone, Serialize)]
/// struct SendEmailPayload {
///     user_id: uuid::Uuid,
///     template: String,
/// }
///
/// impl IntoPayload for SendEmailPayload {
///     auto_payload!();
/// }
/// ```
#[macro_export]
macro_rules! auto_payload {
    () => {
        fn into_payload(&self) -> serde_json::Value {
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
        }
    };
}
