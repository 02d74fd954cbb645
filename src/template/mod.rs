//! Sandboxed template evaluation.
//!
//! Every evaluation gets a fresh QuickJS runtime with a memory limit, a stack
//! limit and an interrupt deadline. The mode string is evaluated as an
//! expression (`return <mode>`) and the resulting value is expanded into JSON.
//!
//! Scripts see:
//! - `Mock.Random.<name>(...)`: the random data generators
//! - `_req`: frozen request accessors (`params`, `query`, `body`, `headers`,
//!   `method`, `path`) and `cookies(name)`
//!
//! Scripts do NOT have filesystem, network, module or process access.
//!
//! The deadline also binds the Rust side: generators and expansion check it,
//! and the generated document is held to `max_output_bytes`.

mod budget;
mod expand;
mod pattern;
mod random;

pub use expand::{parse_key, KeyRule};
pub use budget::{Deadline, MAX_GENERATED_LEN};
pub use random::Random;

use crate::error::{MockError, MockResult};
use crate::matcher::PathParams;
use expand::Expander;
use rquickjs::{Context as JsContext, Ctx, Function, Runtime, Value as JsValue};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::time::{Duration, Instant};
use tracing::debug;

/// Slack given to the blocking task on top of the interpreter deadline.
const JOIN_GRACE: Duration = Duration::from_millis(250);

/// Resource limits for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_limit: usize,
    pub max_stack_size: usize,
    /// Maximum template nesting depth.
    pub max_depth: usize,
    /// Budget for the expanded document, in approximate bytes.
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            memory_limit: 32 * 1024 * 1024,
            max_stack_size: 512 * 1024,
            max_depth: 64,
            max_output_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Read-only view of the current request handed to scripts as `_req`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub params: PathParams,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RequestContext {
    fn to_json(&self) -> Value {
        let pairs = |items: &[(String, String)]| {
            Value::Object(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect::<Map<_, _>>(),
            )
        };
        let mut req = Map::new();
        req.insert("method".to_string(), Value::String(self.method.clone()));
        req.insert("path".to_string(), Value::String(self.path.clone()));
        req.insert("params".to_string(), pairs(&self.params));
        req.insert("query".to_string(), pairs(&self.query));
        req.insert("headers".to_string(), pairs(&self.headers));
        req.insert("body".to_string(), self.body.clone().unwrap_or(Value::Null));
        Value::Object(req)
    }

    fn cookie_jar(&self) -> Value {
        Value::Object(
            self.cookies
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

/// Evaluates template modes, one isolated interpreter per call.
#[derive(Debug, Clone, Default)]
pub struct TemplateSandbox {
    limits: SandboxLimits,
}

impl TemplateSandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Evaluate `mode` and expand the result.
    ///
    /// Runs on the blocking pool. The interpreter interrupts itself at the
    /// deadline; the outer timeout only covers a stuck host thread.
    pub async fn execute(&self, mode: &str, request: RequestContext) -> MockResult<Value> {
        let mode = mode.to_string();
        let limits = self.limits.clone();
        let task = tokio::task::spawn_blocking(move || evaluate(&mode, &request, &limits));

        match tokio::time::timeout(self.limits.timeout + JOIN_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(MockError::SandboxRuntime(format!("sandbox task failed: {}", e))),
            Err(_) => Err(MockError::SandboxTimeout),
        }
    }
}

/// Synchronous evaluation on the current thread.
pub fn evaluate(mode: &str, request: &RequestContext, limits: &SandboxLimits) -> MockResult<Value> {
    let started = Instant::now();
    let deadline = Deadline::new(started + limits.timeout);

    let runtime = Runtime::new()
        .map_err(|e| MockError::SandboxRuntime(format!("failed to create runtime: {}", e)))?;
    runtime.set_memory_limit(limits.memory_limit);
    runtime.set_max_stack_size(limits.max_stack_size);
    {
        let deadline = deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || deadline.expired())));
    }
    let context = JsContext::full(&runtime)
        .map_err(|e| MockError::SandboxRuntime(format!("failed to create context: {}", e)))?;

    let _guard = RandomGuard::set(Random::new().with_deadline(deadline.clone()));

    let result = context.with(|ctx| {
        let fail = |e: rquickjs::Error| js_failure(&ctx, e, &deadline);

        let random_fn = Function::new(ctx.clone(), native_random).map_err(fail)?;
        ctx.globals().set("__random", random_fn).map_err(fail)?;
        ctx.eval::<(), _>(prelude(request)?).map_err(fail)?;
        ctx.globals().set("__mode", mode).map_err(fail)?;

        // Surface syntax and evaluation errors before expanding anything
        ctx.eval::<(), _>("void new Function('return ' + __mode)();")
            .map_err(fail)?;

        let template: JsValue = ctx
            .eval("new Function('return ' + __mode)()")
            .map_err(fail)?;
        Expander::new(ctx.clone(), deadline.clone(), limits)?.expand(template)
    });

    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "Template evaluated"
    );
    result
}

/// Map an interpreter error, preferring the timeout when the deadline fired.
pub(crate) fn js_failure(ctx: &Ctx<'_>, err: rquickjs::Error, deadline: &Deadline) -> MockError {
    if deadline.fired() {
        return MockError::SandboxTimeout;
    }
    match err {
        rquickjs::Error::Exception => MockError::SandboxRuntime(describe_exception(&ctx.catch())),
        other => MockError::SandboxRuntime(other.to_string()),
    }
}

fn describe_exception(thrown: &JsValue<'_>) -> String {
    if let Some(exception) = thrown.as_exception() {
        let message = exception.message().unwrap_or_default();
        return match exception.get::<_, String>("name") {
            Ok(name) if !name.is_empty() => format!("{}: {}", name, message),
            _ => message,
        };
    }
    if let Some(text) = thrown.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }
    "uncaught exception".to_string()
}

fn prelude(request: &RequestContext) -> MockResult<String> {
    let encode = |value: &Value| {
        serde_json::to_string(value).map_err(|e| MockError::SandboxRuntime(e.to_string()))
    };
    let names = encode(&Value::from(random::NAMES.to_vec()))?;
    let req = encode(&request.to_json())?;
    let cookies = encode(&request.cookie_jar())?;

    Ok(format!(
        r#"
var __classify = function (v) {{ return Object.prototype.toString.call(v).slice(8, -1); }};
var __stringify = function (v) {{ return JSON.stringify(v); }};
var __parse = function (s) {{ return JSON.parse(s); }};
var Mock = {{ Random: {{}} }};
{names}.forEach(function (name) {{
    Mock.Random[name] = function () {{
        return JSON.parse(__random(name, JSON.stringify(Array.prototype.slice.call(arguments))));
    }};
}});
Object.freeze(Mock.Random);
var _req = (function (req, jar) {{
    var freeze = function (o) {{
        Object.keys(o).forEach(function (k) {{
            if (o[k] && typeof o[k] === 'object') freeze(o[k]);
        }});
        return Object.freeze(o);
    }};
    req.cookies = function (name) {{
        return Object.prototype.hasOwnProperty.call(jar, name) ? jar[name] : undefined;
    }};
    return freeze(req);
}})({req}, {cookies});
var __call = function (fn, self, name) {{
    return fn.call(self, {{ Mock: Mock, _req: _req, name: name, context: {{ currentContext: self }} }});
}};
"#,
        names = names,
        req = req,
        cookies = cookies,
    ))
}

// Random source for the evaluation running on this thread
thread_local! {
    static RANDOM: RefCell<Option<Random>> = const { RefCell::new(None) };
}

/// Installs the thread's random source and clears it on drop, even on panic.
struct RandomGuard;

impl RandomGuard {
    fn set(random: Random) -> Self {
        RANDOM.with(|cell| *cell.borrow_mut() = Some(random));
        Self
    }
}

impl Drop for RandomGuard {
    fn drop(&mut self) {
        RANDOM.with(|cell| *cell.borrow_mut() = None);
    }
}

/// Run `f` with the current evaluation's random source.
pub(crate) fn with_random<R>(f: impl FnOnce(&mut Random) -> R) -> R {
    RANDOM.with(|cell| {
        let mut slot = cell.borrow_mut();
        f(slot.get_or_insert_with(Random::new))
    })
}

/// Native `__random(name, argsJson)`; returns the generated value as JSON.
///
/// Throws once the deadline has passed so a script looping over generators
/// stops even between interrupt checks.
#[allow(clippy::needless_pass_by_value)]
fn native_random(name: String, args_json: String) -> rquickjs::Result<String> {
    if with_random(|r| r.expired()) {
        return Err(rquickjs::Error::Exception);
    }
    let args: Vec<Value> = serde_json::from_str(&args_json).unwrap_or_default();
    let value = with_random(|r| r.generate(&name, &args)).unwrap_or(Value::Null);
    if with_random(|r| r.expired()) {
        return Err(rquickjs::Error::Exception);
    }
    serde_json::to_string(&value).map_err(|_| rquickjs::Error::Exception)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;

    fn run(mode: &str) -> MockResult<Value> {
        evaluate(mode, &RequestContext::default(), &SandboxLimits::default())
    }

    #[test]
    fn test_deterministic_template() {
        let value = run("{ a: 1, b: 'x', c: [true, null], d: { e: 1.5 } }").unwrap();
        assert_eq!(value, json!({"a": 1, "b": "x", "c": [true, null], "d": {"e": 1.5}}));
    }

    #[test]
    fn test_repeat_rules() {
        let value = run("{ 'list|3': [{ 'id|+1': 1, name: '@first' }], 'star|2': '*' }").unwrap();
        let list = value["list"].as_array().unwrap();
        assert_eq!(list.len(), 3);
        let ids: Vec<i64> = list.iter().map(|i| i["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(list.iter().all(|i| i["name"].as_str().map_or(false, |s| !s.is_empty())));
        assert_eq!(value["star"], json!("**"));
    }

    #[test]
    fn test_number_and_boolean_rules() {
        let value = run("{ 'n|1-10': 1, 'f|1-10.2': 1, 'b|1': true, 'pick|1': ['a', 'b'] }").unwrap();
        let n = value["n"].as_i64().unwrap();
        assert!((1..=10).contains(&n));
        let f = value["f"].as_f64().unwrap();
        assert!((1.0..11.0).contains(&f));
        assert!(value["b"].is_boolean());
        assert!(value["pick"] == json!("a") || value["pick"] == json!("b"));
    }

    #[test]
    fn test_object_pick_rule() {
        let value = run("{ 'o|2': { a: 1, b: 2, c: 3 } }").unwrap();
        assert_eq!(value["o"].as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_placeholders_keep_type_and_reference_siblings() {
        let value = run("{ n: '@integer(5, 5)', first: 'Ada', greeting: 'hi @first', mail: '@email' }").unwrap();
        assert_eq!(value["n"], json!(5));
        assert_eq!(value["greeting"], json!("hi Ada"));
        assert!(value["mail"].as_str().unwrap().contains('@'));
    }

    #[test]
    fn test_reference_to_later_sibling() {
        let value = run("{ greeting: 'hi @first', first: 'Ada' }").unwrap();
        assert_eq!(value["greeting"], json!("hi Ada"));
        assert_eq!(value["first"], json!("Ada"));

        let value = run("{ a: { label: '@/user/name', n: '@b' , b: 7 }, user: { name: 'Bob' } }").unwrap();
        assert_eq!(value["a"]["label"], json!("Bob"));
        assert_eq!(value["a"]["n"], json!(7));
        assert_eq!(value["user"], json!({"name": "Bob"}));
    }

    #[test]
    fn test_self_reference_uses_generator() {
        let value = run("{ name: '@name', a: '@b', b: '@a' }").unwrap();
        let name = value["name"].as_str().unwrap();
        assert!(!name.is_empty() && !name.starts_with('@'), "{}", name);
        // A cycle leaves the inner reference literal
        assert_eq!(value["a"], json!("@a"));
        assert_eq!(value["b"], json!("@a"));
    }

    #[test]
    fn test_repeat_of_empty_string() {
        let value = run("{ 's|3': '', 't|1-5': '' }").unwrap();
        assert_eq!(value, json!({"s": "", "t": ""}));
    }

    #[test]
    fn test_escaped_placeholder() {
        let value = run(r"{ s: 'mail \\@first' }").unwrap();
        assert_eq!(value["s"], json!("mail @first"));
    }

    #[test]
    fn test_regexp_field() {
        let value = run(r"{ phone: /1[3-9]\d{9}/ }").unwrap();
        let phone = value["phone"].as_str().unwrap();
        assert!(Regex::new(r"^1[3-9]\d{9}$").unwrap().is_match(phone));
    }

    #[test]
    fn test_function_fields_see_siblings_and_request() {
        let request = RequestContext {
            params: vec![("id".to_string(), "42".to_string())],
            cookies: vec![("sid".to_string(), "abc".to_string())],
            ..Default::default()
        };
        let mode = "{ full: function () { return this.name + '!'; }, name: 'Ada', \
                    id: function (o) { return o._req.params.id; }, \
                    sid: function (o) { return o._req.cookies('sid'); }, \
                    missing: function (o) { return o._req.cookies('nope') === undefined; } }";
        let value = evaluate(mode, &request, &SandboxLimits::default()).unwrap();
        assert_eq!(value["full"], json!("Ada!"));
        assert_eq!(value["id"], json!("42"));
        assert_eq!(value["sid"], json!("abc"));
        assert_eq!(value["missing"], json!(true));
    }

    #[test]
    fn test_mock_random_in_scripts() {
        let value = run("{ n: Mock.Random.integer(3, 3), w: Mock.Random.word(4) }").unwrap();
        assert_eq!(value["n"], json!(3));
        assert_eq!(value["w"].as_str().unwrap().len(), 4);
    }

    #[test]
    fn test_control_key_passes_through() {
        let value = run("{ _res: { status: 201, data: { x: 1 } } }").unwrap();
        assert_eq!(value, json!({"_res": {"status": 201, "data": {"x": 1}}}));
    }

    #[test]
    fn test_request_is_read_only() {
        let request = RequestContext {
            params: vec![("id".to_string(), "1".to_string())],
            ..Default::default()
        };
        let mode = "(function () { _req.params.id = '2'; return { id: _req.params.id }; })()";
        let value = evaluate(mode, &request, &SandboxLimits::default()).unwrap();
        assert_eq!(value["id"], json!("1"));
    }

    #[test]
    fn test_syntax_error() {
        match run("{ a: ") {
            Err(MockError::SandboxRuntime(msg)) => assert!(msg.contains("SyntaxError"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_thrown_error_message() {
        match run("(function () { throw new Error('boom'); })()") {
            Err(MockError::SandboxRuntime(msg)) => assert_eq!(msg, "Error: boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let started = Instant::now();
        let err = run("(function () { while (true) {} })()").unwrap_err();
        assert_eq!(err, MockError::SandboxTimeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_runaway_expansion_times_out() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(100),
            max_output_bytes: usize::MAX,
            ..Default::default()
        };
        let mode = "{ 'a|10000': [{ 'b|10000': [{ c: '@sentence' }] }] }";
        let err = evaluate(mode, &RequestContext::default(), &limits).unwrap_err();
        assert_eq!(err, MockError::SandboxTimeout);
    }

    #[test]
    fn test_huge_generator_length_is_bounded() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let started = Instant::now();
        let value = evaluate("{ s: '@string(20000000)' }", &RequestContext::default(), &limits).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(value["s"].as_str().unwrap().chars().count(), MAX_GENERATED_LEN);

        let value = run("{ t: '@ctitle(-1)', r: '@range(0, 10000000000)' }").unwrap();
        assert_eq!(value["t"], json!(""));
        assert_eq!(value["r"].as_array().unwrap().len(), MAX_GENERATED_LEN);
    }

    #[test]
    fn test_script_generator_loop_times_out() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let started = Instant::now();
        let mode = "(function () { var s = ''; for (var i = 0; i < 1e9; i++) { s = Mock.Random.string(20000000); } return { s: s }; })()";
        let err = evaluate(mode, &RequestContext::default(), &limits).unwrap_err();
        assert_eq!(err, MockError::SandboxTimeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_output_budget_stops_repeat() {
        let limits = SandboxLimits {
            memory_limit: 4 * 1024 * 1024,
            max_output_bytes: 4 * 1024 * 1024,
            ..Default::default()
        };
        let mode = "{ 's|10000': 'x'.repeat(50000) }";
        match evaluate(mode, &RequestContext::default(), &limits) {
            Err(MockError::SandboxRuntime(msg)) => assert!(msg.contains("exceeds"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }

        let mode = "{ 'list|10000': ['@paragraph(1000)'] }";
        match evaluate(mode, &RequestContext::default(), &limits) {
            Err(MockError::SandboxRuntime(msg)) => assert!(msg.contains("exceeds"), "{}", msg),
            Err(MockError::SandboxTimeout) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_no_host_access() {
        let value = run("{ req: typeof require, proc: typeof process, fetch: typeof fetch }").unwrap();
        assert_eq!(value, json!({"req": "undefined", "proc": "undefined", "fetch": "undefined"}));
    }

    #[tokio::test]
    async fn test_execute_on_blocking_pool() {
        let sandbox = TemplateSandbox::default();
        let value = sandbox
            .execute("{ ok: true }", RequestContext::default())
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let sandbox = TemplateSandbox::new(SandboxLimits {
            timeout: Duration::from_millis(200),
            ..Default::default()
        });
        let err = sandbox
            .execute("(function () { for (;;) {} })()", RequestContext::default())
            .await
            .unwrap_err();
        assert_eq!(err, MockError::SandboxTimeout);
    }
}
