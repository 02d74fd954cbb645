//! Strings matching a regular expression, for `/pattern/` template fields.

use super::budget::MAX_GENERATED_LEN;
use super::random::Random;
use regex_syntax::hir::{Class, ClassUnicode, ClassUnicodeRange, Hir, HirKind};
use regex_syntax::ParserBuilder;

/// Extra repetitions allowed past the minimum of an unbounded quantifier.
const UNBOUNDED_EXTRA: u32 = 8;

/// Generate one string matching `source` under the JS `flags`.
pub fn generate(source: &str, flags: &str, random: &mut Random) -> Result<String, String> {
    let hir = ParserBuilder::new()
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .parse(source)
        .map_err(|e| format!("invalid pattern /{}/: {}", source, e))?;

    let mut out = String::new();
    emit(&hir, random, &mut out)?;
    Ok(out)
}

fn emit(hir: &Hir, random: &mut Random, out: &mut String) -> Result<(), String> {
    if out.len() > MAX_GENERATED_LEN {
        return Err(format!("pattern output exceeds {} bytes", MAX_GENERATED_LEN));
    }
    match hir.kind() {
        HirKind::Empty | HirKind::Look(_) => {}
        HirKind::Literal(literal) => out.push_str(&String::from_utf8_lossy(&literal.0)),
        HirKind::Class(Class::Unicode(class)) => {
            if let Some(c) = pick_unicode(class, random) {
                out.push(c);
            }
        }
        HirKind::Class(Class::Bytes(class)) => {
            let bytes: Vec<u8> = class
                .ranges()
                .iter()
                .flat_map(|r| r.start()..=r.end())
                .filter(u8::is_ascii)
                .collect();
            if let Some(b) = random.pick_from(&bytes) {
                out.push(char::from(*b));
            }
        }
        HirKind::Repetition(rep) => {
            let max = rep.max.unwrap_or(rep.min.saturating_add(UNBOUNDED_EXTRA));
            let times = random.int_between(i64::from(rep.min), i64::from(max));
            for _ in 0..times {
                if random.expired() {
                    return Err("pattern generation timed out".to_string());
                }
                emit(&rep.sub, random, out)?;
            }
        }
        HirKind::Capture(capture) => emit(&capture.sub, random, out)?,
        HirKind::Concat(parts) => {
            for part in parts {
                emit(part, random, out)?;
            }
        }
        HirKind::Alternation(branches) => {
            if let Some(branch) = random.pick_from(branches) {
                emit(branch, random, out)?;
            }
        }
    }
    Ok(())
}

/// Pick a character, preferring printable ASCII members of the class.
fn pick_unicode(class: &ClassUnicode, random: &mut Random) -> Option<char> {
    let mut printable = class.clone();
    printable.intersect(&ClassUnicode::new([ClassUnicodeRange::new(' ', '~')]));
    let class = if printable.ranges().is_empty() { class } else { &printable };

    let total: u64 = class
        .ranges()
        .iter()
        .map(|r| u64::from(r.end() as u32 - r.start() as u32) + 1)
        .sum();
    if total == 0 {
        return None;
    }

    let mut index = random.int_between(0, total as i64 - 1) as u64;
    for range in class.ranges() {
        let size = u64::from(range.end() as u32 - range.start() as u32) + 1;
        if index < size {
            return char::from_u32(range.start() as u32 + index as u32).or(Some(range.start()));
        }
        index -= size;
    }
    None
}
