//! Shape validation for requests, responses and results.
//!
//! The engines run every outbound request and inbound response through a
//! [`Validator`]. [`BasicValidator`] only checks structure: parameter
//! arity and JSON types for the session methods, and the result-or-error
//! shape of responses. Value semantics are left to the server.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::CorrelationId;

use super::request::method;
use super::{LiveNotification, RpcError, RpcOutcome, RpcRequest, RpcResponse};

// ============================================================================
// ValidationContext
// ============================================================================

/// Where a payload is being validated.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Engine name (`http`, `websocket`).
    pub engine: &'a str,
    /// Endpoint the payload belongs to.
    pub endpoint: Option<&'a Url>,
    /// Request the payload answers, when known.
    pub request: Option<&'a RpcRequest>,
}

impl<'a> ValidationContext<'a> {
    /// Creates a context for `engine` and `endpoint`.
    #[inline]
    #[must_use]
    pub fn new(engine: &'a str, endpoint: Option<&'a Url>) -> Self {
        Self {
            engine,
            endpoint,
            request: None,
        }
    }

    /// Attaches the request being answered.
    #[inline]
    #[must_use]
    pub fn with_request(mut self, request: &'a RpcRequest) -> Self {
        self.request = Some(request);
        self
    }

    /// Builds a validation error carrying this context.
    #[must_use]
    pub fn error(&self, message: impl fmt::Display) -> Error {
        let message = match self.request {
            Some(request) => format!("{message} (method {})", request.method),
            None => message.to_string(),
        };
        Error::validation(message, self.engine, self.endpoint)
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Validates and normalizes RPC payloads.
pub trait Validator: Send + Sync + fmt::Debug {
    /// Validates an outbound request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the request is malformed.
    fn parse_rpc_request(&self, request: RpcRequest, ctx: &ValidationContext<'_>)
    -> Result<RpcRequest>;

    /// Parses a decoded frame into a response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the frame is not a response.
    fn parse_rpc_response(&self, value: Value, ctx: &ValidationContext<'_>) -> Result<RpcResponse>;

    /// Validates the result of a successful call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the result does not fit the method.
    fn parse_rpc_result(&self, result: Value, ctx: &ValidationContext<'_>) -> Result<Value>;

    /// Parses the result of an id-less response into a live notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the result is not a notification.
    fn parse_live_result(&self, result: Value, ctx: &ValidationContext<'_>)
    -> Result<LiveNotification>;
}

// ============================================================================
// BasicValidator
// ============================================================================

/// Structural validator for the session methods and response shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicValidator;

impl Validator for BasicValidator {
    fn parse_rpc_request(
        &self,
        request: RpcRequest,
        ctx: &ValidationContext<'_>,
    ) -> Result<RpcRequest> {
        let ctx = ctx.with_request(&request);

        if request.method.is_empty() {
            return Err(ctx.error("method must not be empty"));
        }

        let params = &request.params;
        match request.method.as_str() {
            method::USE => {
                expect_arity(&ctx, params, 0, 2)?;
                for (index, param) in params.iter().enumerate() {
                    if !(param.is_null() || param.is_string()) {
                        return Err(ctx.error(format!("param {index} must be a string or null")));
                    }
                }
            }
            method::LET => {
                expect_arity(&ctx, params, 2, 2)?;
                expect_string(&ctx, params, 0)?;
            }
            method::UNSET | method::AUTHENTICATE => {
                expect_arity(&ctx, params, 1, 1)?;
                expect_string(&ctx, params, 0)?;
            }
            method::QUERY => {
                expect_arity(&ctx, params, 1, 2)?;
                match &params[0] {
                    Value::String(_) => {}
                    Value::Object(object) if object.get("text").is_some_and(Value::is_string) => {
                        if !object.get("vars").is_none_or(is_vars) {
                            return Err(ctx.error("query vars must be an object"));
                        }
                    }
                    _ => return Err(ctx.error("query must be a string or { text, vars }")),
                }
                if !params.get(1).is_none_or(is_vars) {
                    return Err(ctx.error("query vars must be an object"));
                }
            }
            method::SIGNIN | method::SIGNUP => {
                expect_arity(&ctx, params, 1, 1)?;
                if !params[0].is_object() {
                    return Err(ctx.error("credentials must be an object"));
                }
            }
            method::INVALIDATE => expect_arity(&ctx, params, 0, 0)?,
            _ => {}
        }

        Ok(request)
    }

    fn parse_rpc_response(&self, value: Value, ctx: &ValidationContext<'_>) -> Result<RpcResponse> {
        let Value::Object(mut object) = value else {
            return Err(ctx.error("response must be an object"));
        };

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(CorrelationId::from(id)),
            Some(Value::Number(n)) => Some(CorrelationId::from(n.to_string())),
            Some(_) => return Err(ctx.error("response id must be a string")),
        };

        let outcome = match (object.remove("result"), object.remove("error")) {
            (Some(result), None) => RpcOutcome::Result(result),
            (None, Some(error)) => RpcOutcome::Error(parse_rpc_error(error, ctx)?),
            (Some(_), Some(_)) => return Err(ctx.error("response has both result and error")),
            (None, None) => return Err(ctx.error("response has neither result nor error")),
        };

        Ok(RpcResponse { id, outcome })
    }

    fn parse_rpc_result(&self, result: Value, ctx: &ValidationContext<'_>) -> Result<Value> {
        let Some(request) = ctx.request else {
            return Ok(result);
        };

        match request.method.as_str() {
            method::SIGNIN | method::SIGNUP if !result.is_string() => {
                Err(ctx.error("token result must be a string"))
            }
            _ => Ok(result),
        }
    }

    fn parse_live_result(
        &self,
        result: Value,
        ctx: &ValidationContext<'_>,
    ) -> Result<LiveNotification> {
        serde_json::from_value(result)
            .map_err(|e| ctx.error(format!("invalid live notification: {e}")))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn expect_arity(
    ctx: &ValidationContext<'_>,
    params: &[Value],
    min: usize,
    max: usize,
) -> Result<()> {
    if (min..=max).contains(&params.len()) {
        Ok(())
    } else if min == max {
        Err(ctx.error(format!("expected {min} params, got {}", params.len())))
    } else {
        Err(ctx.error(format!(
            "expected {min} to {max} params, got {}",
            params.len()
        )))
    }
}

fn expect_string(ctx: &ValidationContext<'_>, params: &[Value], index: usize) -> Result<()> {
    if params.get(index).is_some_and(Value::is_string) {
        Ok(())
    } else {
        Err(ctx.error(format!("param {index} must be a string")))
    }
}

fn is_vars(value: &Value) -> bool {
    value.is_null() || value.is_object()
}

fn parse_rpc_error(value: Value, ctx: &ValidationContext<'_>) -> Result<RpcError> {
    let Value::Object(object) = value else {
        return Err(ctx.error("error must be an object"));
    };

    let code = object
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| ctx.error("error code must be an integer"))?;
    let message = object
        .get("message")
        .and_then(Value::as_str)
        .ok_or_else(|| ctx.error("error message must be a string"))?
        .to_string();

    Ok(RpcError { code, message })
}

// ============================================================================
// Tests
// ============================================================================
