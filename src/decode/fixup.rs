//! Best-effort repair of MediaHighway text.
//!
//! Some MediaHighway broadcasts carry the inverted exclamation mark (byte `0xa1` in their private
//! character set) as the three letters `jjj`.  It appears after a sentence or clause break, so the
//! substitution is only made when the run follows `.`, `:` or `,` (directly, or after one space).
//! Anything else is left untouched.

const MARKER: &str = "jjj";
const GLYPH: char = '\u{a1}';

/// Apply the MediaHighway text fix-up to `text`.
pub fn fix_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find(MARKER) {
        let (before, after) = rest.split_at(at);
        out.push_str(before);
        if follows_break(&out) {
            out.extend([GLYPH; 3]);
        } else {
            out.push_str(MARKER);
        }
        rest = &after[MARKER.len()..];
    }
    out.push_str(rest);
    out
}

fn follows_break(preceding: &str) -> bool {
    let mut chars = preceding.chars().rev();
    match chars.next() {
        Some('.') | Some(':') | Some(',') => true,
        Some(' ') => matches!(chars.next(), Some('.') | Some(':') | Some(',')),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn after_punctuation() {
        assert_eq!(fix_string("Fin. jjj"), "Fin. \u{a1}\u{a1}\u{a1}");
        assert_eq!(fix_string("Nota:jjj"), "Nota:\u{a1}\u{a1}\u{a1}");
        assert_eq!(fix_string("uno,jjj dos"), "uno,\u{a1}\u{a1}\u{a1} dos");
    }

    #[test]
    fn left_alone() {
        assert_eq!(fix_string("ajjjb"), "ajjjb");
        assert_eq!(fix_string("jjj"), "jjj");
        assert_eq!(fix_string("Fin.  jjj"), "Fin.  jjj");
        assert_eq!(fix_string(""), "");
    }
}
