//! Argument conversion for native script functions

use cadex_kernel::Shape;
use glam::DVec3;
use rhai::{Dynamic, EvalAltResult, NativeCallContext};

pub(crate) type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// Runtime error at the current call site
pub(crate) fn runtime(ctx: &NativeCallContext, message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(message.into().into(), ctx.call_position()).into()
}

fn mismatch(ctx: &NativeCallContext, expected: &str, actual: &str) -> Box<EvalAltResult> {
    EvalAltResult::ErrorMismatchDataType(
        expected.to_string(),
        actual.to_string(),
        ctx.call_position(),
    )
    .into()
}

/// Integers and floats are both numbers
pub(crate) fn number(ctx: &NativeCallContext, value: &Dynamic) -> FnResult<f64> {
    if let Ok(v) = value.as_float() {
        Ok(v)
    } else if let Ok(v) = value.as_int() {
        Ok(v as f64)
    } else {
        Err(mismatch(ctx, "number", value.type_name()))
    }
}

pub(crate) fn flag(ctx: &NativeCallContext, value: &Dynamic) -> FnResult<bool> {
    value
        .as_bool()
        .map_err(|actual| mismatch(ctx, "bool", actual))
}

pub(crate) fn text(ctx: &NativeCallContext, value: Dynamic) -> FnResult<String> {
    value
        .into_string()
        .map_err(|actual| mismatch(ctx, "string", actual))
}

/// `[x, y, z]` as a vector
pub(crate) fn vector(ctx: &NativeCallContext, value: Dynamic) -> FnResult<DVec3> {
    let array = value
        .into_array()
        .map_err(|actual| mismatch(ctx, "array", actual))?;
    match array.as_slice() {
        [x, y, z] => Ok(DVec3::new(number(ctx, x)?, number(ctx, y)?, number(ctx, z)?)),
        other => Err(mismatch(ctx, "[number; 3]", &format!("[dynamic; {}]", other.len()))),
    }
}

/// A list of `[x, y, z]` points
pub(crate) fn points(ctx: &NativeCallContext, value: Dynamic) -> FnResult<Vec<DVec3>> {
    value
        .into_array()
        .map_err(|actual| mismatch(ctx, "array", actual))?
        .into_iter()
        .map(|p| vector(ctx, p))
        .collect()
}

pub(crate) fn shape(ctx: &NativeCallContext, value: Dynamic) -> FnResult<Shape> {
    let type_name = value.type_name();
    value
        .try_cast::<Shape>()
        .ok_or_else(|| mismatch(ctx, "Shape", type_name))
}

/// A single shape or an array of shapes
pub(crate) fn shapes(ctx: &NativeCallContext, value: Dynamic) -> FnResult<Vec<Shape>> {
    if value.is::<Shape>() {
        return Ok(vec![shape(ctx, value)?]);
    }
    value
        .into_array()
        .map_err(|actual| mismatch(ctx, "array of shapes", actual))?
        .into_iter()
        .map(|s| shape(ctx, s))
        .collect()
}

pub(crate) fn strings(ctx: &NativeCallContext, value: Dynamic) -> FnResult<Vec<String>> {
    value
        .into_array()
        .map_err(|actual| mismatch(ctx, "array of strings", actual))?
        .into_iter()
        .map(|s| text(ctx, s))
        .collect()
}
