//! Response records resolved by request correlation

use crate::event::{meta, Event};
use crate::EnvelopeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Outcome status of a correlated request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Error => "error",
            ResponseStatus::Timeout => "timeout",
            ResponseStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ResponseStatus {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(ResponseStatus::Ok),
            "error" => Ok(ResponseStatus::Error),
            "timeout" => Ok(ResponseStatus::Timeout),
            "cancelled" => Ok(ResponseStatus::Cancelled),
            _ => Err(EnvelopeError::UnknownLiteral {
                kind: "response status",
                value: s.to_string(),
            }),
        }
    }
}

/// Status, error code and payload delivered to a waiting caller
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: String,
    pub status: ResponseStatus,
    pub err_code: String,
    pub metadata: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok(request_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self::with_status(request_id, ResponseStatus::Ok, "", data)
    }

    pub fn error(request_id: impl Into<String>, err_code: impl Into<String>) -> Self {
        Self::with_status(request_id, ResponseStatus::Error, err_code, Vec::new())
    }

    pub fn timeout(request_id: impl Into<String>) -> Self {
        Self::with_status(request_id, ResponseStatus::Timeout, "request timeout", Vec::new())
    }

    pub fn cancelled(request_id: impl Into<String>) -> Self {
        Self::with_status(request_id, ResponseStatus::Cancelled, "request cancelled", Vec::new())
    }

    fn with_status(
        request_id: impl Into<String>,
        status: ResponseStatus,
        err_code: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            err_code: err_code.into(),
            metadata: BTreeMap::new(),
            data,
        }
    }

    /// Extract the response carried by a callback event
    pub fn from_event(ev: &Event) -> Result<Self, EnvelopeError> {
        let request_id = ev
            .request_id()
            .ok_or(EnvelopeError::MissingField(meta::REQUEST_ID))?;
        let status = ev
            .attr(meta::RESPONSE_STATUS)
            .ok_or(EnvelopeError::MissingField(meta::RESPONSE_STATUS))?
            .parse()?;

        Ok(Self {
            request_id: request_id.to_string(),
            status,
            err_code: ev.attr(meta::RESPONSE_ERR_CODE).unwrap_or_default().to_string(),
            metadata: ev.metadata.clone(),
            data: ev.raw_data().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}
