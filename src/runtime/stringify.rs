//! Bounded, cycle-safe rendering of script values for diagnostics.

use deno_core::v8;

/// Containers nested deeper than this render as `<truncated>`.
pub const MAX_DEPTH: usize = 6;
/// Arrays and objects render at most this many entries.
pub const MAX_ELEMENTS: usize = 50;

const TRUNCATED: &str = "<truncated>";
const RECURSIVE: &str = "<recursive reference>";
const THREW: &str = "<exception>";

/// Renders values the way the redirected console prints them.
#[derive(Default)]
pub struct ValueStringifier<'s> {
    // Containers on the current recursion path, outermost first.
    path: Vec<v8::Local<'s, v8::Object>>,
}

impl<'s> ValueStringifier<'s> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render one value.
    ///
    /// Exceptions raised while walking it (throwing getters, revoked
    /// proxies) are caught and the affected entry renders as `<exception>`.
    pub fn render(scope: &mut v8::HandleScope<'s>, value: v8::Local<v8::Value>) -> String {
        let tc = &mut v8::TryCatch::new(scope);
        let value = v8::Local::new(tc, value);
        Self::new().stringify(tc, value, 0)
    }

    fn stringify(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> String {
        if value.is_undefined() {
            "undefined".to_string()
        } else if value.is_null() {
            "null".to_string()
        } else if value.is_boolean() {
            value.boolean_value(scope).to_string()
        } else if value.is_string() {
            value.to_rust_string_lossy(scope)
        } else if value.is_function() {
            describe_function(scope, value)
        } else if value.is_array() || value.is_typed_array() {
            self.container(scope, value, depth, Self::list)
        } else if value.is_object() && !value.is_native_error() {
            self.container(scope, value, depth, Self::record)
        } else {
            detail_string(scope, value)
        }
    }

    fn container(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
        render: fn(&mut Self, &mut v8::HandleScope<'s>, v8::Local<'s, v8::Object>, usize) -> String,
    ) -> String {
        if depth >= MAX_DEPTH {
            return TRUNCATED.to_string();
        }
        let Ok(object) = v8::Local::<v8::Object>::try_from(value) else {
            return detail_string(scope, value);
        };

        if self.path.iter().any(|seen| seen.strict_equals(object.into())) {
            return RECURSIVE.to_string();
        }
        self.path.push(object);
        let rendered = render(self, scope, object, depth + 1);
        self.path.pop();
        rendered
    }

    fn list(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
        depth: usize,
    ) -> String {
        let len = if let Ok(array) = v8::Local::<v8::Array>::try_from(object) {
            array.length() as usize
        } else if let Ok(typed) = v8::Local::<v8::TypedArray>::try_from(object) {
            typed.length()
        } else {
            0
        };

        let mut parts = Vec::with_capacity(len.min(MAX_ELEMENTS) + 1);
        for index in 0..len.min(MAX_ELEMENTS) {
            let item = guarded(scope, |scope| object.get_index(scope, index as u32));
            parts.push(match item {
                Some(item) => self.stringify(scope, item, depth),
                None => THREW.to_string(),
            });
        }
        if len > MAX_ELEMENTS {
            parts.push(TRUNCATED.to_string());
        }
        format!("[{}]", parts.join(", "))
    }

    fn record(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
        depth: usize,
    ) -> String {
        let names = guarded(scope, |scope| {
            object.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
        });
        let Some(names) = names else {
            return THREW.to_string();
        };

        let len = names.length() as usize;
        let mut parts = Vec::with_capacity(len.min(MAX_ELEMENTS) + 1);
        for index in 0..len.min(MAX_ELEMENTS) {
            let Some(key) = guarded(scope, |scope| names.get_index(scope, index as u32)) else {
                continue;
            };
            let name = key.to_rust_string_lossy(scope);
            let rendered = match guarded(scope, |scope| object.get(scope, key)) {
                Some(item) => self.stringify(scope, item, depth),
                None => THREW.to_string(),
            };
            parts.push(format!("{name}: {rendered}"));
        }
        if len > MAX_ELEMENTS {
            parts.push(TRUNCATED.to_string());
        }
        format!("{{{}}}", parts.join(", "))
    }
}

/// Run `read` under its own try-catch. `None` means it threw; the exception
/// is cleared when the try-catch drops.
fn guarded<'s, T>(
    scope: &mut v8::HandleScope<'s>,
    read: impl FnOnce(&mut v8::HandleScope<'s>) -> Option<T>,
) -> Option<T> {
    let tc = &mut v8::TryCatch::new(scope);
    read(tc)
}

fn describe_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> String {
    let name = v8::Local::<v8::Function>::try_from(value)
        .map(|function| function.get_name(scope).to_rust_string_lossy(scope))
        .unwrap_or_default();
    if name.is_empty() {
        "[Function]".to_string()
    } else {
        format!("[Function: {name}]")
    }
}

fn detail_string<'s>(scope: &mut v8::HandleScope<'s>, value: v8::Local<'s, v8::Value>) -> String {
    guarded(scope, |scope| value.to_detail_string(scope))
        .map(|text| text.to_rust_string_lossy(scope))
        .unwrap_or_else(|| THREW.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::initialize_platform_once;
    use deno_core::{JsRuntime, RuntimeOptions};

    fn render(code: &str) -> String {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            v8_platform: Some(initialize_platform_once()),
            ..Default::default()
        });
        let value = runtime
            .execute_script("<stringify>", code.to_string())
            .unwrap();
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        ValueStringifier::render(scope, local)
    }

    #[test]
    fn test_primitives() {
        assert_eq!(render("undefined"), "undefined");
        assert_eq!(render("null"), "null");
        assert_eq!(render("true"), "true");
        assert_eq!(render("'plain text'"), "plain text");
        assert_eq!(render("42"), "42");
        assert_eq!(render("1.5"), "1.5");
    }

    #[test]
    fn test_containers() {
        assert_eq!(render("[1, 'two', null]"), "[1, two, null]");
        assert_eq!(render("({a: 1, b: [true]})"), "{a: 1, b: [true]}");
        assert_eq!(render("new Uint8Array([3, 4])"), "[3, 4]");
        assert_eq!(render("({})"), "{}");
    }

    #[test]
    fn test_functions() {
        assert_eq!(render("(function named() {})"), "[Function: named]");
        assert_eq!(render("(() => {})"), "[Function]");
    }

    #[test]
    fn test_errors_and_symbols_use_engine_string() {
        assert_eq!(render("new Error('boom')"), "Error: boom");
        assert_eq!(render("Symbol('tag')"), "Symbol(tag)");
    }

    #[test]
    fn test_cycles() {
        assert_eq!(render("var a = [1]; a.push(a); a"), "[1, <recursive reference>]");
        assert_eq!(
            render("var o = {name: 'o'}; o.self = o; o"),
            "{name: o, self: <recursive reference>}"
        );
    }

    #[test]
    fn test_shared_reference_is_not_a_cycle() {
        assert_eq!(render("var s = [0]; [s, s]"), "[[0], [0]]");
    }

    #[test]
    fn test_depth_truncation() {
        assert_eq!(render("[[[[[[[1]]]]]]]"), "[[[[[[<truncated>]]]]]]");
        assert_eq!(render("[[[[[[1]]]]]]"), "[[[[[[1]]]]]]");
    }

    #[test]
    fn test_length_truncation() {
        let rendered = render("Array.from({length: 60}, (_, i) => i)");
        assert!(rendered.starts_with("[0, 1, 2"));
        assert!(rendered.ends_with("48, 49, <truncated>]"));
    }

    #[test]
    fn test_nested_objects_truncate() {
        let rendered = render("var o = 1; for (var i = 0; i < 10; i++) { o = {a: o}; } o");
        assert_eq!(rendered, format!("{}<truncated>{}", "{a: ".repeat(6), "}".repeat(6)));
    }

    #[test]
    fn test_distinct_objects_on_one_path() {
        assert_eq!(render("({a: {a: {a: {}}}})"), "{a: {a: {a: {}}}}");

        let rendered = render("Array.from({length: 40}, (_, i) => ({inner: {id: i}}))");
        assert!(!rendered.contains(RECURSIVE));
        assert!(rendered.ends_with("{inner: {id: 39}}]"));
    }

    #[test]
    fn test_throwing_getter() {
        assert_eq!(
            render("({ok: 1, get bad() { throw new Error('nope'); }, after: 2})"),
            "{ok: 1, bad: <exception>, after: 2}"
        );
    }

    #[test]
    fn test_revoked_proxy() {
        let code = "var p = Proxy.revocable({}, {}); p.revoke(); [p.proxy, 'next']";
        assert_eq!(render(code), "[<exception>, next]");
    }
}
