//! Thin helpers over the raw V8 API.

use crate::runtime::error::EngineError;
use deno_core::error::JsError;
use deno_core::v8;

pub fn v8_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    text: &str,
) -> Result<v8::Local<'s, v8::String>, EngineError> {
    v8::String::new(scope, text).ok_or(EngineError::Allocation("string"))
}

pub fn script_origin<'s>(
    scope: &mut v8::HandleScope<'s>,
    source_url: &str,
    script_id: i32,
) -> Result<v8::ScriptOrigin<'s>, EngineError> {
    let name = v8_string(scope, source_url)?;
    Ok(v8::ScriptOrigin::new(
        scope,
        name.into(),
        0,
        0,
        false,
        script_id,
        None,
        false,
        false,
        false,
        None,
    ))
}

/// Convert whatever the try-catch scope caught into an [`EngineError`].
pub fn caught_exception(tc: &mut v8::TryCatch<v8::HandleScope>) -> EngineError {
    match tc.exception() {
        Some(exception) => {
            let js_error = JsError::from_v8_exception(tc, exception);
            EngineError::Exception {
                message: js_error.exception_message.clone(),
                stack: js_error.stack.clone(),
            }
        }
        None => EngineError::Terminated,
    }
}

/// Compile and run a classic script in the current context.
pub fn evaluate_script(
    scope: &mut v8::HandleScope,
    source: &str,
    source_url: &str,
    script_id: i32,
) -> Result<v8::Global<v8::Value>, EngineError> {
    let tc = &mut v8::TryCatch::new(scope);
    let code = v8_string(tc, source)?;
    let origin = script_origin(tc, source_url, script_id)?;

    let Some(script) = v8::Script::compile(tc, code, Some(&origin)) else {
        return Err(caught_exception(tc));
    };
    let Some(value) = script.run(tc) else {
        return Err(caught_exception(tc));
    };
    Ok(v8::Global::new(tc, value))
}

/// `JSON.stringify`, with `undefined` mapped to `null`.
pub fn to_json_text(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> Result<String, EngineError> {
    let tc = &mut v8::TryCatch::new(scope);
    match v8::json::stringify(tc, value) {
        Some(text) => {
            let text = text.to_rust_string_lossy(tc);
            if text == "undefined" {
                Ok("null".to_string())
            } else {
                Ok(text)
            }
        }
        None if tc.has_caught() => Err(EngineError::Json(caught_exception(tc).to_string())),
        None => Ok("null".to_string()),
    }
}

/// `JSON.parse` into a local value.
pub fn parse_json<'s>(
    scope: &mut v8::HandleScope<'s>,
    text: &str,
) -> Result<v8::Local<'s, v8::Value>, EngineError> {
    let tc = &mut v8::TryCatch::new(scope);
    let json = v8_string(tc, text)?;
    match v8::json::parse(tc, json) {
        Some(value) => Ok(value),
        None => Err(EngineError::Json(caught_exception(tc).to_string())),
    }
}

/// Schedule `new Error(message)` to be thrown when the callback returns.
pub fn throw_error(scope: &mut v8::HandleScope, message: &str) {
    let message = v8::String::new(scope, message).unwrap_or_else(|| v8::String::empty(scope));
    let exception = v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}

/// Look up a property on an object by name.
pub fn get_named<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
) -> Result<v8::Local<'s, v8::Value>, EngineError> {
    let key = v8_string(scope, name)?;
    Ok(object
        .get(scope, key.into())
        .unwrap_or_else(|| v8::undefined(scope).into()))
}

/// Install a native function as a named property of `target`.
pub fn set_function(
    scope: &mut v8::HandleScope,
    target: v8::Local<v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) -> Result<(), EngineError> {
    let key = v8_string(scope, name)?;
    let function = v8::Function::builder(callback)
        .build(scope)
        .ok_or(EngineError::Allocation("function"))?;
    function.set_name(key);
    target.set(scope, key.into(), function.into());
    Ok(())
}

/// Invoke `function` with `receiver` as `this`, capturing exceptions.
pub fn call_function(
    scope: &mut v8::HandleScope,
    function: v8::Local<v8::Function>,
    receiver: v8::Local<v8::Value>,
    args: &[v8::Local<v8::Value>],
) -> Result<v8::Global<v8::Value>, EngineError> {
    let tc = &mut v8::TryCatch::new(scope);
    match function.call(tc, receiver, args) {
        Some(value) => Ok(v8::Global::new(tc, value)),
        None => Err(caught_exception(tc)),
    }
}
