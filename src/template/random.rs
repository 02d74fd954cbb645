//! Random data generators behind `@placeholder` strings and `Mock.Random`.

use super::budget::{clamp_len, Deadline, MAX_GENERATED_LEN};
use base64::Engine;
use chrono::{DateTime, Local, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

/// Generator names exposed to templates.
pub const NAMES: &[&str] = &[
    "boolean", "bool", "natural", "integer", "int", "float", "character", "char", "string",
    "str", "range", "date", "time", "datetime", "now", "color", "hex", "rgb", "rgba", "word",
    "sentence", "paragraph", "title", "cword", "csentence", "cparagraph", "ctitle", "first",
    "last", "name", "cfirst", "clast", "cname", "url", "domain", "protocol", "tld", "email", "ip",
    "id", "guid", "uuid", "increment", "inc", "image", "img", "dataImage", "pick", "shuffle",
    "upper", "lower", "capitalize", "zip", "province", "city", "region",
];

const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const NUMBER: &str = "0123456789";
const SYMBOL: &str = "!@#$%^&*()[]";

const FIRST_NAMES: &[&str] = &[
    "James", "John", "Robert", "Michael", "William", "David", "Richard", "Charles", "Joseph",
    "Thomas", "Mary", "Patricia", "Linda", "Barbara", "Elizabeth", "Jennifer", "Maria", "Susan",
    "Margaret", "Dorothy", "Lisa", "Nancy", "Karen", "Betty", "Helen",
];
const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Miller", "Davis", "Garcia", "Rodriguez",
    "Wilson", "Martinez", "Anderson", "Taylor", "Thomas", "Hernandez", "Moore", "Martin",
    "Jackson", "Thompson", "White", "Lopez", "Lee", "Gonzalez", "Harris", "Clark",
];
const CFIRST: &[&str] = &[
    "王", "李", "张", "刘", "陈", "杨", "赵", "黄", "周", "吴", "徐", "孙", "胡", "朱", "高", "林",
    "何", "郭", "马", "罗",
];
const CLAST: &[&str] = &[
    "伟", "芳", "娜", "秀英", "敏", "静", "丽", "强", "磊", "军", "洋", "勇", "艳", "杰", "娟", "涛",
    "明", "超", "秀兰", "霞",
];
const CWORD_POOL: &str = "的一是在不了有和人这中大为上个国我以要他时来用们生到作地于出就分对成会可主发年动同工也能下过子说产种面而方后多定行学法所民得经十三之进着等部度家电力里如水化高自二理起小物现实加量都两体制机当使点从业本去把性好应开它合还因由其些然前外天政四日那社义事平形相全表间样与关各重新线内数正心反你明看原又么利比或但质气第向道命此变条只没结解问意建月公无系军很情者最立代想已通并提直题党程展五果料象员革位入常文总次品式活设及管特件长求老头基资边流路级少图山统接知较将组见计别她手角期根论运农指几九区强放决西被干做必战先回则任取据处理府研质";
const TLDS: &[&str] = &["com", "net", "org", "edu", "gov", "io", "dev", "cn", "co"];
const PROTOCOLS: &[&str] = &["http", "https", "ftp", "ws", "wss"];
const PROVINCES: &[&str] = &[
    "北京市", "上海市", "天津市", "重庆市", "广东省", "浙江省", "江苏省", "四川省", "湖北省",
    "湖南省", "山东省", "河南省", "福建省", "陕西省",
];
const CITIES: &[&str] = &[
    "广州市", "深圳市", "杭州市", "南京市", "成都市", "武汉市", "长沙市", "济南市", "郑州市",
    "福州市", "西安市", "苏州市", "宁波市", "厦门市",
];
const REGIONS: &[&str] = &["东北", "华北", "华东", "华中", "华南", "西南", "西北"];
const AREA_CODES: &[&str] = &[
    "110101", "310101", "120101", "500101", "440103", "330102", "320102", "510104", "420102",
];

/// Per-generation random source.
///
/// `increment` is scoped to one template evaluation. Lengths and counts taken
/// from arguments are clamped to [`MAX_GENERATED_LEN`], and loops stop once
/// the deadline expires.
pub struct Random {
    rng: StdRng,
    increment: i64,
    deadline: Option<Deadline>,
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl Random {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            increment: 0,
            deadline: None,
        }
    }

    /// Deterministic source for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            increment: 0,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whether the evaluation this source belongs to ran out of time.
    pub fn expired(&self) -> bool {
        self.deadline.as_ref().is_some_and(Deadline::expired)
    }

    /// Whether `name` is a known generator (case-insensitive).
    pub fn is_generator(name: &str) -> bool {
        NAMES.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    /// Random integer in `[min, max]` (bounds swapped if reversed).
    pub fn int_between(&mut self, min: i64, max: i64) -> i64 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        self.rng.gen_range(lo..=hi)
    }

    /// True with probability `p`.
    pub fn chance(&mut self, p: f64) -> bool {
        self.rng.gen::<f64>() < p
    }

    /// Shuffle a slice in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Pick one element of a non-empty slice.
    pub fn pick_from<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut self.rng)
    }

    /// Random decimal digits, the last one non-zero.
    pub fn decimals(&mut self, count: usize) -> String {
        (0..count)
            .map(|i| {
                let lo = if i + 1 == count { 1 } else { 0 };
                char::from(b'0' + self.rng.gen_range(lo..=9u8))
            })
            .collect()
    }

    /// Build up to `len` characters (clamped), stopping early at the deadline.
    fn chars_with(&mut self, len: i64, mut next: impl FnMut(&mut Self) -> Option<char>) -> String {
        let len = clamp_len(len);
        let mut out = String::with_capacity(len);
        for i in 0..len {
            if i % 1024 == 0 && self.expired() {
                break;
            }
            if let Some(c) = next(self) {
                out.push(c);
            }
        }
        out
    }

    /// Produce up to `count` items (clamped), stopping early at the deadline.
    fn items_with<T>(&mut self, count: i64, mut next: impl FnMut(&mut Self) -> T) -> Vec<T> {
        let count = clamp_len(count);
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            if self.expired() {
                break;
            }
            out.push(next(self));
        }
        out
    }

    /// Run a named generator. Returns `None` for unknown names.
    pub fn generate(&mut self, name: &str, args: &[Value]) -> Option<Value> {
        let value = match name.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => json!(self.boolean(args)),
            "natural" => json!(self.int_between(
                arg_i64(args, 0).unwrap_or(0),
                arg_i64(args, 1).unwrap_or(9_007_199_254_740_992),
            )),
            "integer" | "int" => json!(self.int_between(
                arg_i64(args, 0).unwrap_or(-9_007_199_254_740_992),
                arg_i64(args, 1).unwrap_or(9_007_199_254_740_992),
            )),
            "float" => self.float(args),
            "character" | "char" => json!(self.character(arg_str(args, 0))),
            "string" | "str" => json!(self.string(args)),
            "range" => self.range(args),
            "date" => json!(self.date(arg_str(args, 0).unwrap_or("yyyy-MM-dd"))),
            "time" => json!(self.date(arg_str(args, 0).unwrap_or("HH:mm:ss"))),
            "datetime" => json!(self.date(arg_str(args, 0).unwrap_or("yyyy-MM-dd HH:mm:ss"))),
            "now" => json!(now(args)),
            "color" | "hex" => json!(format!("#{:06x}", self.rng.gen_range(0..=0xffffffu32))),
            "rgb" => {
                let (r, g, b) = (self.rng.gen::<u8>(), self.rng.gen::<u8>(), self.rng.gen::<u8>());
                json!(format!("rgb({}, {}, {})", r, g, b))
            }
            "rgba" => {
                let (r, g, b) = (self.rng.gen::<u8>(), self.rng.gen::<u8>(), self.rng.gen::<u8>());
                json!(format!("rgba({}, {}, {}, 0.{})", r, g, b, self.decimals(2)))
            }
            "word" => json!(self.word(args)),
            "sentence" => json!(self.sentence(args)),
            "paragraph" => json!(self.paragraph(args)),
            "title" => json!(self.title(args)),
            "cword" => json!(self.cword(args)),
            "csentence" => json!(self.csentence(args)),
            "cparagraph" => json!(self.cparagraph(args)),
            "ctitle" => {
                let (min, max) = bounds(args, 3, 7);
                let len = self.int_between(min, max);
                json!(self.chinese(len))
            }
            "first" => json!(self.pick_str(FIRST_NAMES)),
            "last" => json!(self.pick_str(LAST_NAMES)),
            "name" => {
                let first = self.pick_str(FIRST_NAMES);
                let last = self.pick_str(LAST_NAMES);
                if arg_bool(args, 0) {
                    let middle = self.pick_str(FIRST_NAMES);
                    json!(format!("{} {} {}", first, middle, last))
                } else {
                    json!(format!("{} {}", first, last))
                }
            }
            "cfirst" => json!(self.pick_str(CFIRST)),
            "clast" => json!(self.pick_str(CLAST)),
            "cname" => json!(format!("{}{}", self.pick_str(CFIRST), self.pick_str(CLAST))),
            "url" => json!(self.url(arg_str(args, 0), arg_str(args, 1))),
            "domain" => json!(self.domain(arg_str(args, 0))),
            "protocol" => json!(self.pick_str(PROTOCOLS)),
            "tld" => json!(self.pick_str(TLDS)),
            "email" => {
                let domain = match arg_str(args, 0) {
                    Some(d) => d.to_string(),
                    None => self.domain(None),
                };
                let local = format!("{}.{}", self.character(Some("lower")), self.word(&[]));
                json!(format!("{}@{}", local, domain))
            }
            "ip" => json!(format!(
                "{}.{}.{}.{}",
                self.rng.gen_range(1..=255u8),
                self.rng.gen::<u8>(),
                self.rng.gen::<u8>(),
                self.rng.gen::<u8>()
            )),
            "id" => json!(self.id_number()),
            "guid" | "uuid" => json!(self.guid()),
            "increment" | "inc" => {
                self.increment += arg_i64(args, 0).unwrap_or(1);
                json!(self.increment)
            }
            "image" | "img" => json!(self.image(args)),
            "dataimage" => json!(self.data_image(args)),
            "pick" => self.pick(args),
            "shuffle" => {
                let mut items = match args {
                    [Value::Array(items)] => items.clone(),
                    _ => args.to_vec(),
                };
                self.shuffle(&mut items);
                Value::Array(items)
            }
            "upper" => json!(arg_str(args, 0).unwrap_or_default().to_uppercase()),
            "lower" => json!(arg_str(args, 0).unwrap_or_default().to_lowercase()),
            "capitalize" => json!(capitalize(arg_str(args, 0).unwrap_or_default())),
            "zip" => {
                let len = arg_i64(args, 0).unwrap_or(6).max(1);
                json!(self.chars_with(len, |r| Some(r.digit())))
            }
            "province" => json!(self.pick_str(PROVINCES)),
            "city" => {
                if arg_bool(args, 0) {
                    json!(format!("{} {}", self.pick_str(PROVINCES), self.pick_str(CITIES)))
                } else {
                    json!(self.pick_str(CITIES))
                }
            }
            "region" => json!(self.pick_str(REGIONS)),
            _ => return None,
        };
        Some(value)
    }

    fn boolean(&mut self, args: &[Value]) -> bool {
        match arg_bool_opt(args, 2) {
            Some(current) => {
                let min = arg_i64(args, 0).unwrap_or(1).max(0) as f64;
                let max = arg_i64(args, 1).unwrap_or(1).max(0) as f64;
                let p = if min + max > 0.0 { min / (min + max) } else { 0.5 };
                if self.chance(p) {
                    current
                } else {
                    !current
                }
            }
            None => self.rng.gen(),
        }
    }

    fn float(&mut self, args: &[Value]) -> Value {
        let int = self.int_between(
            arg_i64(args, 0).unwrap_or(-9_007_199_254_740_992),
            arg_i64(args, 1).unwrap_or(9_007_199_254_740_992),
        );
        let dmin = arg_i64(args, 2).unwrap_or(0).clamp(0, 17);
        let dmax = arg_i64(args, 3).unwrap_or(17).clamp(0, 17);
        let count = self.int_between(dmin, dmax) as usize;
        if count == 0 {
            return json!(int);
        }
        let text = format!("{}.{}", int, self.decimals(count));
        text.parse::<f64>().map(|f| json!(f)).unwrap_or_else(|_| json!(int))
    }

    fn digit(&mut self) -> char {
        char::from(b'0' + self.rng.gen_range(0..=9u8))
    }

    fn character(&mut self, pool: Option<&str>) -> String {
        let chars = Self::character_pool(pool);
        self.pick_from(&chars).map(|c| c.to_string()).unwrap_or_default()
    }

    fn character_pool(pool: Option<&str>) -> Vec<char> {
        let pool = match pool.map(|p| p.to_ascii_lowercase()) {
            Some(p) if p == "lower" => LOWER.to_string(),
            Some(p) if p == "upper" => UPPER.to_string(),
            Some(p) if p == "number" => NUMBER.to_string(),
            Some(p) if p == "symbol" => SYMBOL.to_string(),
            Some(p) if p == "alpha" => format!("{}{}", LOWER, UPPER),
            _ => match pool {
                Some(custom) if !custom.is_empty() => custom.to_string(),
                _ => format!("{}{}{}{}", LOWER, UPPER, NUMBER, SYMBOL),
            },
        };
        pool.chars().collect()
    }

    fn string(&mut self, args: &[Value]) -> String {
        // string(), string(len), string(min, max), string(pool, len), string(pool, min, max)
        let (pool, rest) = match args.first() {
            Some(Value::String(pool)) => (Some(pool.as_str()), &args[1..]),
            _ => (None, args),
        };
        let len = match (arg_i64(rest, 0), arg_i64(rest, 1)) {
            (Some(min), Some(max)) => self.int_between(min, max),
            (Some(len), None) => len,
            _ => self.int_between(3, 7),
        };
        let chars = Self::character_pool(pool);
        self.chars_with(len, |r| r.pick_from(&chars).copied())
    }

    fn range(&mut self, args: &[Value]) -> Value {
        let (start, stop) = match (arg_i64(args, 0), arg_i64(args, 1)) {
            (Some(stop), None) => (0, stop),
            (Some(start), Some(stop)) => (start, stop),
            _ => (0, 0),
        };
        let step = usize::try_from(arg_i64(args, 2).unwrap_or(1).max(1)).unwrap_or(1);
        let items: Vec<Value> = (start..stop)
            .step_by(step)
            .take(MAX_GENERATED_LEN)
            .map(|i| json!(i))
            .collect();
        Value::Array(items)
    }

    fn date(&mut self, format: &str) -> String {
        let now = Utc::now().timestamp();
        let secs = self.rng.gen_range(0..=now);
        let date: DateTime<Local> = Local
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_else(|| Local::now());
        date.format(&convert_format(format)).to_string()
    }

    fn word(&mut self, args: &[Value]) -> String {
        let (min, max) = bounds(args, 3, 10);
        let len = self.int_between(min, max);
        let chars: Vec<char> = LOWER.chars().collect();
        self.chars_with(len, |r| r.pick_from(&chars).copied())
    }

    fn sentence(&mut self, args: &[Value]) -> String {
        let (min, max) = bounds(args, 12, 18);
        let count = self.int_between(min, max).max(1);
        let words = self.items_with(count, |r| r.word(&[]));
        format!("{}.", capitalize(&words.join(" ")))
    }

    fn paragraph(&mut self, args: &[Value]) -> String {
        let (min, max) = bounds(args, 3, 7);
        let count = self.int_between(min, max).max(1);
        let sentences = self.items_with(count, |r| r.sentence(&[]));
        sentences.join(" ")
    }

    fn title(&mut self, args: &[Value]) -> String {
        let (min, max) = bounds(args, 3, 7);
        let count = self.int_between(min, max).max(1);
        let words = self.items_with(count, |r| capitalize(&r.word(&[])));
        words.join(" ")
    }

    fn chinese(&mut self, len: i64) -> String {
        let pool: Vec<char> = CWORD_POOL.chars().collect();
        self.chars_with(len, |r| r.pick_from(&pool).copied())
    }

    fn cword(&mut self, args: &[Value]) -> String {
        // cword(), cword(len), cword(min, max), cword(pool, ...)
        let (pool, rest) = match args.first() {
            Some(Value::String(pool)) => (Some(pool.clone()), &args[1..]),
            _ => (None, args),
        };
        let len = match (arg_i64(rest, 0), arg_i64(rest, 1)) {
            (Some(min), Some(max)) => self.int_between(min, max),
            (Some(len), None) => len,
            _ => 1,
        };
        match pool {
            Some(pool) => {
                let chars: Vec<char> = pool.chars().collect();
                self.chars_with(len, |r| r.pick_from(&chars).copied())
            }
            None => self.chinese(len),
        }
    }

    fn csentence(&mut self, args: &[Value]) -> String {
        let (min, max) = bounds(args, 12, 18);
        let len = self.int_between(min, max).max(1);
        format!("{}。", self.chinese(len))
    }

    fn cparagraph(&mut self, args: &[Value]) -> String {
        let (min, max) = bounds(args, 3, 7);
        let count = self.int_between(min, max).max(1);
        self.items_with(count, |r| r.csentence(&[])).concat()
    }

    fn pick_str(&mut self, items: &[&str]) -> String {
        self.pick_from(items).map(|s| s.to_string()).unwrap_or_default()
    }

    fn domain(&mut self, tld: Option<&str>) -> String {
        let tld = match tld {
            Some(t) => t.to_string(),
            None => self.pick_str(TLDS),
        };
        format!("{}.{}", self.word(&[]), tld)
    }

    fn url(&mut self, protocol: Option<&str>, host: Option<&str>) -> String {
        let protocol = match protocol {
            Some(p) => p.to_string(),
            None => self.pick_str(PROTOCOLS),
        };
        let host = match host {
            Some(h) => h.to_string(),
            None => self.domain(None),
        };
        format!("{}://{}/{}", protocol, host, self.word(&[]))
    }

    fn guid(&mut self) -> String {
        format!(
            "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
            self.rng.gen::<u32>(),
            self.rng.gen::<u16>(),
            self.rng.gen::<u16>() & 0x0fff,
            (self.rng.gen::<u16>() & 0x3fff) | 0x8000,
            self.rng.gen::<u64>() & 0xffff_ffff_ffff,
        )
    }

    /// 18-digit resident identity number with a valid check digit.
    fn id_number(&mut self) -> String {
        const WEIGHTS: [u32; 17] = [7, 9, 10, 5, 8, 4, 2, 1, 6, 3, 7, 9, 10, 5, 8, 4, 2];
        const CHECK: &[u8; 11] = b"10X98765432";

        let area = self.pick_str(AREA_CODES);
        let birthday = self.date("yyyyMMdd");
        let sequence: String = (0..3).map(|_| self.digit()).collect();
        let body = format!("{}{}{}", area, birthday, sequence);

        let sum: u32 = body
            .chars()
            .zip(WEIGHTS.iter())
            .filter_map(|(c, w)| c.to_digit(10).map(|d| d * w))
            .sum();
        format!("{}{}", body, char::from(CHECK[(sum % 11) as usize]))
    }

    fn image(&mut self, args: &[Value]) -> String {
        let size = arg_str(args, 0).unwrap_or("300x250");
        let background = arg_str(args, 1)
            .map(|s| s.trim_start_matches('#').to_string())
            .unwrap_or_else(|| format!("{:06x}", self.rng.gen_range(0..=0xffffffu32)));
        let foreground = arg_str(args, 2)
            .map(|s| s.trim_start_matches('#').to_string())
            .unwrap_or_else(|| "ffffff".to_string());
        let format = arg_str(args, 3).unwrap_or("png");
        let mut url = format!(
            "http://dummyimage.com/{}/{}/{}.{}",
            size, background, foreground, format
        );
        if let Some(text) = arg_str(args, 4) {
            url.push_str("&text=");
            url.push_str(&urlencoding::encode(text));
        }
        url
    }

    fn data_image(&mut self, args: &[Value]) -> String {
        let size = arg_str(args, 0).unwrap_or("300x250");
        let (width, height) = size.split_once('x').unwrap_or(("300", "250"));
        let text = arg_str(args, 1).unwrap_or(size);
        let background = format!("#{:06x}", self.rng.gen_range(0..=0xffffffu32));
        let svg = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\">\
             <rect width=\"100%\" height=\"100%\" fill=\"{bg}\"/>\
             <text x=\"50%\" y=\"50%\" fill=\"#fff\" text-anchor=\"middle\">{t}</text></svg>",
            w = width,
            h = height,
            bg = background,
            t = text
        );
        format!(
            "data:image/svg+xml;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(svg)
        )
    }

    fn pick(&mut self, args: &[Value]) -> Value {
        let items: &[Value] = match args {
            [Value::Array(items), ..] => items,
            _ => args,
        };
        self.pick_from(items).cloned().unwrap_or(Value::Null)
    }
}

fn now(args: &[Value]) -> String {
    // now(), now(unit), now(format), now(unit, format)
    let units = ["year", "month", "week", "day", "hour", "minute", "second"];
    let (unit, format) = match (arg_str(args, 0), arg_str(args, 1)) {
        (Some(u), f) if units.contains(&u) => (Some(u), f),
        (f, _) => (None, f),
    };
    let mut current = Local::now();
    if let Some(unit) = unit {
        let start = match unit {
            "year" => current.format("%Y-01-01 00:00:00").to_string(),
            "month" => current.format("%Y-%m-01 00:00:00").to_string(),
            "day" | "week" => current.format("%Y-%m-%d 00:00:00").to_string(),
            "hour" => current.format("%Y-%m-%d %H:00:00").to_string(),
            "minute" => current.format("%Y-%m-%d %H:%M:00").to_string(),
            _ => current.format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&start, "%Y-%m-%d %H:%M:%S") {
            if let Some(truncated) = Local.from_local_datetime(&naive).single() {
                current = truncated;
            }
        }
    }
    current
        .format(&convert_format(format.unwrap_or("yyyy-MM-dd HH:mm:ss")))
        .to_string()
}

/// Translate `yyyy-MM-dd HH:mm:ss` style patterns into strftime.
pub fn convert_format(format: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("M", "%-m"),
        ("dd", "%d"),
        ("d", "%-d"),
        ("HH", "%H"),
        ("H", "%-H"),
        ("hh", "%I"),
        ("h", "%-I"),
        ("mm", "%M"),
        ("m", "%-M"),
        ("ss", "%S"),
        ("s", "%-S"),
        ("SS", "%3f"),
        ("A", "%p"),
        ("a", "%P"),
        ("T", "%s"),
    ];
    let mut out = String::new();
    let mut rest = format;
    'outer: while !rest.is_empty() {
        for (token, spec) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(spec);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn bounds(args: &[Value], default_min: i64, default_max: i64) -> (i64, i64) {
    match (arg_i64(args, 0), arg_i64(args, 1)) {
        (Some(min), Some(max)) => (min, max),
        (Some(len), None) => (len, len),
        _ => (default_min, default_max),
    }
}

fn arg_i64(args: &[Value], index: usize) -> Option<i64> {
    match args.get(index)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn arg_str(args: &[Value], index: usize) -> Option<&str> {
    args.get(index).and_then(Value::as_str)
}

fn arg_bool_opt(args: &[Value], index: usize) -> Option<bool> {
    match args.get(index)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s == "true" => Some(true),
        Value::String(s) if s == "false" => Some(false),
        _ => None,
    }
}

fn arg_bool(args: &[Value], index: usize) -> bool {
    arg_bool_opt(args, index).unwrap_or(false)
}
