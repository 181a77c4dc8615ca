//! JSON bodies that may be omitted.
//!
//! An empty body yields `T::default()`. Anything else must parse as `T`: syntax errors
//! render as 400 and well-formed bodies with bad values (an impossible date) as 422.

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::Json;
use serde::de::DeserializeOwned;
use service_core::error::AppError;

#[derive(Debug, Clone, Default)]
pub struct OptionalJson<T>(pub T);

fn json_error(rejection: JsonRejection) -> AppError {
    let message = anyhow::anyhow!(rejection.body_text());
    if rejection.status() == StatusCode::UNPROCESSABLE_ENTITY {
        AppError::UnprocessableEntity(message)
    } else {
        AppError::BadRequest(message)
    }
}

#[async_trait]
impl<T, S> FromRequest<S> for OptionalJson<T>
where
    T: DeserializeOwned + Default,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))?;

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(OptionalJson(T::default()));
        }

        let Json(value) = Json::<T>::from_bytes(&bytes).map_err(json_error)?;
        Ok(OptionalJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtos::PayInvoiceRequest;
    use axum::body::Body;
    use chrono::NaiveDate;

    async fn extract(body: &'static str) -> Result<PayInvoiceRequest, AppError> {
        let req = Request::builder()
            .method("POST")
            .uri("/v1/invoices/00000000-0000-0000-0000-000000000000/pay")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        OptionalJson::<PayInvoiceRequest>::from_request(req, &())
            .await
            .map(|OptionalJson(request)| request)
    }

    #[tokio::test]
    async fn empty_body_uses_defaults() {
        let request = extract("").await.unwrap();
        assert!(request.paid_at.is_none());
    }

    #[tokio::test]
    async fn reads_supplied_date() {
        let request = extract(r#"{"paid_at":"2024-03-15"}"#).await.unwrap();
        assert_eq!(request.paid_at, NaiveDate::from_ymd_opt(2024, 3, 15));
    }

    #[tokio::test]
    async fn impossible_date_is_unprocessable() {
        let err = extract(r#"{"paid_at":"2024-13-45"}"#).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn broken_json_is_bad_request() {
        let err = extract(r#"{"paid_at":"#).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
