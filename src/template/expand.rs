//! Template expansion rules.
//!
//! Keys may carry a generation rule after `|`:
//!
//! | Rule              | string       | number              | boolean        | array           | object         |
//! |-------------------|--------------|---------------------|----------------|-----------------|----------------|
//! | `count`           | repeat       | the count           | `count/(count+1)` | pick one if 1, else repeat | pick `count` keys |
//! | `min-max`         | repeat       | in range            | `min/(min+max)` | repeat          | pick keys      |
//! | `+step`           |              | sequence            |                | cycle elements  |                |
//! | `min-max.dmin-dmax` |            | decimal places      |                |                 |                |
//!
//! Strings are then scanned for `@placeholder(args)` references. A reference
//! to a sibling that has not been generated yet generates it on the spot.

use super::budget::{weight, Deadline, OutputBudget};
use super::random::Random;
use super::{js_failure, pattern, with_random, SandboxLimits};
use crate::error::{MockError, MockResult};
use regex::Regex;
use rquickjs::{Ctx, Function, Value as JsValue};
use serde_json::{Map, Number, Value};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Upper bound for repeat counts from key rules.
const MAX_REPEAT: i64 = 10_000;

static KEY_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\+(\d+)|([+-]?\d+)(?:-([+-]?\d+))?)?(?:\.(\d+)(?:-(\d+))?)?$")
        .expect("key rule pattern")
});

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\\*)@(/?[A-Za-z_$][\w$]*(?:/[A-Za-z_$][\w$]*)*)(?:\(([^()]*)\))?")
        .expect("placeholder pattern")
});

/// Generation rule parsed from a `name|rule` key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRule {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub dmin: Option<i64>,
    pub dmax: Option<i64>,
    pub step: Option<i64>,
}

impl KeyRule {
    fn has_range(&self) -> bool {
        self.min.is_some()
    }

    fn count(&self, random: &mut Random) -> Option<i64> {
        match (self.min, self.max) {
            (Some(min), Some(max)) => Some(random.int_between(min, max)),
            (Some(min), None) => Some(min),
            _ => None,
        }
    }

    fn decimals(&self, random: &mut Random) -> Option<usize> {
        match (self.dmin, self.dmax) {
            (Some(min), Some(max)) => Some(random.int_between(min, max).clamp(0, 17) as usize),
            (Some(count), None) => Some(count.clamp(0, 17) as usize),
            _ => None,
        }
    }
}

/// Split a key into its name and optional rule.
pub fn parse_key(key: &str) -> (&str, Option<KeyRule>) {
    let Some((name, rule)) = key.rsplit_once('|') else {
        return (key, None);
    };
    let Some(caps) = KEY_RULE.captures(rule) else {
        return (key, None);
    };
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<i64>().ok());
    let rule = KeyRule {
        step: num(1),
        min: num(2),
        max: num(3),
        dmin: num(4),
        dmax: num(5),
    };
    (name, Some(rule))
}

/// JS helper functions installed by the sandbox prelude.
pub(crate) struct Helpers<'js> {
    pub classify: Function<'js>,
    pub call: Function<'js>,
    pub stringify: Function<'js>,
    pub parse: Function<'js>,
}

impl<'js> Helpers<'js> {
    pub fn load(ctx: &Ctx<'js>) -> rquickjs::Result<Self> {
        let globals = ctx.globals();
        Ok(Self {
            classify: globals.get("__classify")?,
            call: globals.get("__call")?,
            stringify: globals.get("__stringify")?,
            parse: globals.get("__parse")?,
        })
    }
}

/// An object under construction.
struct Frame<'js> {
    generated: Map<String, Value>,
    /// Properties not generated yet, as `(raw key, template)` in generation order.
    pending: Vec<(String, JsValue<'js>)>,
    /// Names being generated right now; references to them fall through to generators.
    active: HashSet<String>,
    path: String,
    depth: usize,
}

/// Walks an evaluated template and produces the generated document.
pub(crate) struct Expander<'js> {
    ctx: Ctx<'js>,
    helpers: Helpers<'js>,
    deadline: Deadline,
    max_depth: usize,
    output: OutputBudget,
    /// Per-path counters for `+step` rules.
    sequences: HashMap<String, i64>,
    /// Objects under construction, outermost first.
    frames: Vec<Frame<'js>>,
}

impl<'js> Expander<'js> {
    pub fn new(ctx: Ctx<'js>, deadline: Deadline, limits: &SandboxLimits) -> MockResult<Self> {
        let helpers = Helpers::load(&ctx).map_err(|e| js_failure(&ctx, e, &deadline))?;
        Ok(Self {
            ctx,
            helpers,
            deadline,
            max_depth: limits.max_depth,
            output: OutputBudget::new(limits.max_output_bytes),
            sequences: HashMap::new(),
            frames: Vec::new(),
        })
    }

    /// Expand a whole template.
    pub fn expand(&mut self, template: JsValue<'js>) -> MockResult<Value> {
        self.value(template, "", None, "", 0)
    }

    fn fail(&self, err: rquickjs::Error) -> MockError {
        js_failure(&self.ctx, err, &self.deadline)
    }

    fn charge(&mut self, value: &Value) -> MockResult<()> {
        self.output.charge(weight(value))
    }

    fn classify(&self, value: &JsValue<'js>) -> MockResult<String> {
        self.helpers
            .classify
            .call::<_, String>((value.clone(),))
            .map_err(|e| self.fail(e))
    }

    fn value(
        &mut self,
        template: JsValue<'js>,
        name: &str,
        rule: Option<&KeyRule>,
        path: &str,
        depth: usize,
    ) -> MockResult<Value> {
        if self.deadline.expired() {
            return Err(MockError::SandboxTimeout);
        }
        if depth > self.max_depth {
            return Err(MockError::SandboxRuntime(format!(
                "template nesting exceeds {} levels",
                self.max_depth
            )));
        }
        self.charge(&Value::Null)?;

        match self.classify(&template)?.as_str() {
            "Undefined" | "Null" => Ok(Value::Null),
            "Boolean" => Ok(Value::Bool(self.boolean(template.as_bool().unwrap_or(false), rule))),
            "Number" => Ok(self.number(js_number(&template), rule, path)),
            "String" => {
                let text = match template.as_string() {
                    Some(s) => s.to_string().map_err(|e| self.fail(e))?,
                    None => String::new(),
                };
                self.string(&text, rule)
            }
            "Array" => self.array(template, rule, path, depth),
            "Object" => self.object(template, rule, path, depth),
            "RegExp" => self.regexp(template, rule),
            "Function" => {
                let this = Value::Object(
                    self.frames
                        .last()
                        .map(|frame| frame.generated.clone())
                        .unwrap_or_default(),
                );
                self.call(template, &this, name)
            }
            _ => self.to_json(template),
        }
    }

    fn boolean(&mut self, template: bool, rule: Option<&KeyRule>) -> bool {
        let Some(rule) = rule.filter(|r| r.has_range()) else {
            return template;
        };
        let min = rule.min.unwrap_or(1).max(0) as f64;
        let max = rule.max.unwrap_or(1).max(0) as f64;
        let p = if min + max > 0.0 { min / (min + max) } else { 0.5 };
        with_random(|r| if r.chance(p) { template } else { !template })
    }

    fn number(&mut self, template: f64, rule: Option<&KeyRule>, path: &str) -> Value {
        let Some(rule) = rule else {
            return number_json(template);
        };

        if let Some(step) = rule.step {
            let seen = self.sequences.entry(path.to_string()).or_insert(0);
            let value = template + (step * *seen) as f64;
            *seen += 1;
            return number_json(value);
        }

        with_random(|r| {
            let count = rule.count(r);
            match rule.decimals(r) {
                Some(places) => {
                    let int = count.unwrap_or(template.trunc() as i64);
                    let text = template.to_string();
                    let mut fraction: String = text
                        .split_once('.')
                        .map(|(_, f)| f.chars().take(places).collect())
                        .unwrap_or_default();
                    if fraction.len() < places {
                        fraction.push_str(&r.decimals(places - fraction.len()));
                    }
                    if fraction.is_empty() {
                        return Value::from(int);
                    }
                    format!("{}.{}", int, fraction)
                        .parse::<f64>()
                        .map(number_json)
                        .unwrap_or_else(|_| Value::from(int))
                }
                None => match count {
                    Some(count) => Value::from(count),
                    None => number_json(template),
                },
            }
        })
    }

    fn string(&mut self, template: &str, rule: Option<&KeyRule>) -> MockResult<Value> {
        let count = rule.and_then(|r| with_random(|random| r.count(random)));
        let text = match count {
            Some(count) => {
                let times = count.clamp(0, MAX_REPEAT) as usize;
                self.output.charge(template.len().saturating_mul(times))?;
                template.repeat(times)
            }
            None => {
                self.output.charge(template.len())?;
                template.to_string()
            }
        };
        self.placeholders(&text)
    }

    fn array(
        &mut self,
        template: JsValue<'js>,
        rule: Option<&KeyRule>,
        path: &str,
        depth: usize,
    ) -> MockResult<Value> {
        let items = match template.as_array() {
            Some(array) => array
                .iter::<JsValue<'js>>()
                .collect::<rquickjs::Result<Vec<_>>>()
                .map_err(|e| self.fail(e))?,
            None => Vec::new(),
        };
        if items.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }

        let rule = rule.cloned().unwrap_or_default();

        if let Some(step) = rule.step {
            let seen = self.sequences.entry(path.to_string()).or_insert(0);
            let index = (*seen * step).rem_euclid(items.len() as i64) as usize;
            *seen += 1;
            return self.value(items[index].clone(), "", None, path, depth + 1);
        }

        match (rule.min, rule.max) {
            (Some(1), None) => {
                let index = with_random(|r| r.int_between(0, items.len() as i64 - 1)) as usize;
                self.value(items[index].clone(), "", None, path, depth + 1)
            }
            (Some(_), _) => {
                let times = with_random(|r| rule.count(r)).unwrap_or(1).clamp(0, MAX_REPEAT);
                let mut out = Vec::new();
                for _ in 0..times {
                    for item in &items {
                        out.push(self.value(item.clone(), "", None, path, depth + 1)?);
                    }
                }
                Ok(Value::Array(out))
            }
            _ => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.value(item, "", None, path, depth + 1)?);
                }
                Ok(Value::Array(out))
            }
        }
    }

    fn object(
        &mut self,
        template: JsValue<'js>,
        rule: Option<&KeyRule>,
        path: &str,
        depth: usize,
    ) -> MockResult<Value> {
        let mut props = match template.as_object() {
            Some(object) => object
                .props::<String, JsValue<'js>>()
                .collect::<rquickjs::Result<Vec<_>>>()
                .map_err(|e| self.fail(e))?,
            None => Vec::new(),
        };

        if let Some(count) = rule.and_then(|r| with_random(|random| r.count(random))) {
            with_random(|r| r.shuffle(&mut props));
            props.truncate(count.max(0) as usize);
        }

        // Function fields see the generated siblings, so they run last.
        let (functions, plain): (Vec<_>, Vec<_>) =
            props.into_iter().partition(|(_, v)| v.is_function());

        self.frames.push(Frame {
            generated: Map::new(),
            pending: plain.into_iter().chain(functions).collect(),
            active: HashSet::new(),
            path: path.to_string(),
            depth,
        });
        let index = self.frames.len() - 1;
        let result = self.fill(index);
        let frame = self.frames.pop().map(|f| f.generated).unwrap_or_default();
        result.map(|_| Value::Object(frame))
    }

    /// Generate the remaining properties of the frame at `index`.
    fn fill(&mut self, index: usize) -> MockResult<()> {
        while let Some(frame) = self.frames.get_mut(index) {
            if frame.pending.is_empty() {
                break;
            }
            let (key, template) = frame.pending.remove(0);
            self.property(index, key, template)?;
        }
        Ok(())
    }

    fn property(&mut self, index: usize, key: String, template: JsValue<'js>) -> MockResult<()> {
        let (name, rule) = parse_key(&key);
        let name = name.to_string();
        let (child_path, depth) = match self.frames.get_mut(index) {
            Some(frame) => {
                frame.active.insert(name.clone());
                let child_path = if frame.path.is_empty() {
                    name.clone()
                } else {
                    format!("{}.{}", frame.path, name)
                };
                (child_path, frame.depth)
            }
            None => return Ok(()),
        };

        let generated = self.value(template, &name, rule.as_ref(), &child_path, depth + 1);

        if let Some(frame) = self.frames.get_mut(index) {
            frame.active.remove(&name);
            frame.generated.insert(name, generated?);
        }
        Ok(())
    }

    /// Generate a not-yet-generated sibling `name` of the frame at `index`, in
    /// that frame's own context.
    fn generate_pending(&mut self, index: usize, name: &str) -> MockResult<()> {
        let Some(frame) = self.frames.get_mut(index) else {
            return Ok(());
        };
        if frame.active.contains(name) || frame.generated.contains_key(name) {
            return Ok(());
        }
        let Some(position) = frame.pending.iter().position(|(key, _)| parse_key(key).0 == name) else {
            return Ok(());
        };
        let (key, template) = frame.pending.remove(position);

        let above = self.frames.split_off(index + 1);
        let result = self.property(index, key, template);
        self.frames.extend(above);
        result
    }

    fn regexp(&mut self, template: JsValue<'js>, rule: Option<&KeyRule>) -> MockResult<Value> {
        let Some(object) = template.as_object() else {
            return Ok(Value::Null);
        };
        let source: String = object.get("source").map_err(|e| self.fail(e))?;
        let flags: String = object.get("flags").unwrap_or_default();
        let times = rule
            .and_then(|r| with_random(|random| r.count(random)))
            .unwrap_or(1)
            .clamp(0, MAX_REPEAT);

        let mut out = String::new();
        for _ in 0..times {
            if self.deadline.expired() {
                return Err(MockError::SandboxTimeout);
            }
            let piece = with_random(|r| pattern::generate(&source, &flags, r)).map_err(|e| {
                if self.deadline.fired() {
                    MockError::SandboxTimeout
                } else {
                    MockError::SandboxRuntime(e)
                }
            })?;
            self.output.charge(piece.len())?;
            out.push_str(&piece);
        }
        Ok(Value::String(out))
    }

    fn call(&mut self, function: JsValue<'js>, this: &Value, name: &str) -> MockResult<Value> {
        let this_json = serde_json::to_string(this)
            .map_err(|e| MockError::SandboxRuntime(e.to_string()))?;
        let this: JsValue<'js> = self
            .helpers
            .parse
            .call((this_json,))
            .map_err(|e| self.fail(e))?;
        let result: JsValue<'js> = self
            .helpers
            .call
            .call((function, this, name.to_string()))
            .map_err(|e| self.fail(e))?;
        self.to_json(result)
    }

    fn to_json(&mut self, value: JsValue<'js>) -> MockResult<Value> {
        let text: Option<String> = self
            .helpers
            .stringify
            .call((value,))
            .map_err(|e| self.fail(e))?;
        match text {
            Some(text) => {
                self.output.charge(text.len())?;
                serde_json::from_str(&text).map_err(|e| {
                    MockError::SandboxRuntime(format!("unserializable value: {}", e))
                })
            }
            None => Ok(Value::Null),
        }
    }

    /// Replace `@name(args)` references in a string.
    ///
    /// A string consisting of exactly one placeholder keeps the generated
    /// value's type.
    fn placeholders(&mut self, text: &str) -> MockResult<Value> {
        if !text.contains('@') {
            return Ok(Value::String(text.to_string()));
        }

        if let Some(caps) = PLACEHOLDER.captures(text) {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if whole == text && caps[1].is_empty() {
                if let Some(value) = self.resolve(&caps[2], caps.get(3).map(|m| m.as_str()))? {
                    return Ok(value);
                }
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            let slashes = caps[1].len();
            if slashes % 2 == 1 {
                // Escaped: drop one backslash, keep the rest literal
                out.push_str(&whole.as_str()[1..]);
                continue;
            }
            out.push_str(&caps[1][..slashes / 2]);

            match self.resolve(&caps[2], caps.get(3).map(|m| m.as_str()))? {
                Some(Value::String(s)) => out.push_str(&s),
                Some(other) => out.push_str(&other.to_string()),
                None => out.push_str(&whole.as_str()[slashes..]),
            }
        }
        out.push_str(&text[last..]);
        Ok(Value::String(out))
    }

    /// Siblings shadow generators of the same name.
    fn resolve(&mut self, name: &str, args: Option<&str>) -> MockResult<Option<Value>> {
        if self.deadline.expired() {
            return Err(MockError::SandboxTimeout);
        }
        let value = match self.reference(name)? {
            Some(value) => Some(value),
            None if !name.contains('/') && Random::is_generator(name) => {
                let args = args.map(parse_args).unwrap_or_default();
                with_random(|r| r.generate(name, &args))
            }
            None => None,
        };
        if self.deadline.fired() {
            return Err(MockError::SandboxTimeout);
        }
        if let Some(value) = &value {
            self.charge(value)?;
        }
        Ok(value)
    }

    /// Look up a sibling value: `@sibling`, `@sibling/child` or `@/root/child`.
    /// A sibling that is still pending is generated first.
    fn reference(&mut self, name: &str) -> MockResult<Option<Value>> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        let (index, path) = match name.strip_prefix('/') {
            Some(rest) => (0, rest),
            None => (self.frames.len() - 1, name),
        };
        let mut segments = path.split('/');
        let Some(first) = segments.next() else {
            return Ok(None);
        };
        self.generate_pending(index, first)?;

        let Some(mut current) = self.frames.get(index).and_then(|f| f.generated.get(first)) else {
            return Ok(None);
        };
        for segment in segments {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        Ok(Some(current.clone()))
    }
}

fn js_number(value: &JsValue<'_>) -> f64 {
    value
        .as_int()
        .map(f64::from)
        .or_else(|| value.as_float())
        .unwrap_or(0.0)
}

fn number_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Parse placeholder arguments: `1, 10`, `'yyyy-MM-dd'`, `"a", true`.
pub fn parse_args(args: &str) -> Vec<Value> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut nesting = 0usize;

    for c in args.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '[' | '{') => {
                nesting += 1;
                current.push(c);
            }
            (None, ']' | '}') => {
                nesting = nesting.saturating_sub(1);
                current.push(c);
            }
            (None, ',') if nesting == 0 => {
                out.push(parse_arg(&current));
                current.clear();
            }
            (None, c) => current.push(c),
        }
    }
    if !current.trim().is_empty() || !out.is_empty() {
        out.push(parse_arg(&current));
    }
    out
}

fn parse_arg(raw: &str) -> Value {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        return Value::String(inner.to_string());
    }
    if raw == "undefined" {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
