//! Datum type - runtime values flowing through the join pipeline

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A single value in a row
#[derive(Debug, Clone, Default)]
pub enum Datum {
    /// NULL value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (covers Int, BigInt)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value (covers Varchar, Text)
    String(String),
    /// Timestamp as unix milliseconds
    Timestamp(i64),
}

impl Datum {
    /// Check if this datum is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Get a numeric type tag for ordering different types
    fn type_tag(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) => 2,
            Datum::String(_) => 4,
            Datum::Timestamp(_) => 6,
        }
    }

    /// Convert to boolean, returns None if NULL or not convertible
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Bool(b) => Some(*b),
            Datum::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Convert to i64, returns None if NULL or not convertible
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Datum::Int(i) => Some(*i),
            Datum::Float(f) => Some(*f as i64),
            Datum::Bool(b) => Some(i64::from(*b)),
            Datum::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Convert to f64, returns None if NULL or not convertible
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Datum::Float(f) => Some(*f),
            Datum::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Convert to string reference, returns None if NULL or not a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    /// SQL comparison: unknown when either side is NULL
    pub fn sql_cmp(&self, other: &Datum) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            None
        } else {
            Some(self.cmp(other))
        }
    }

    /// Negate this datum (for unary minus)
    pub fn negate(&self) -> Option<Datum> {
        match self {
            Datum::Int(i) => Some(Datum::Int(i.wrapping_neg())),
            Datum::Float(f) => Some(Datum::Float(-f)),
            Datum::Null => Some(Datum::Null),
            _ => None,
        }
    }

    /// Logical NOT
    pub fn not(&self) -> Option<Datum> {
        match self {
            Datum::Bool(b) => Some(Datum::Bool(!b)),
            Datum::Int(i) => Some(Datum::Bool(*i == 0)),
            Datum::Null => Some(Datum::Null),
            _ => None,
        }
    }

    /// Check if string matches pattern (SQL LIKE)
    pub fn like(&self, pattern: &Datum) -> Option<Datum> {
        match (self, pattern) {
            (Datum::String(s), Datum::String(p)) => Some(Datum::Bool(like_match(s, p))),
            (Datum::Null, _) | (_, Datum::Null) => Some(Datum::Null),
            _ => None,
        }
    }

    /// Natural-language full-text match: every word of `query` occurs in
    /// this string, ignoring case
    pub fn contains_words(&self, query: &str) -> bool {
        let Datum::String(text) = self else {
            return false;
        };
        let haystack: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let mut words = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .peekable();
        if words.peek().is_none() {
            return false;
        }
        words.all(|w| haystack.iter().any(|h| *h == w.to_lowercase()))
    }

    /// Approximate in-buffer width in bytes
    pub fn width(&self) -> usize {
        match self {
            Datum::Null | Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) | Datum::Timestamp(_) => 8,
            Datum::String(s) => s.len() + 2,
        }
    }
}

/// Simple SQL LIKE pattern matching without regex
/// % matches any sequence of characters
/// _ matches any single character
fn like_match(s: &str, pattern: &str) -> bool {
    let s_chars: Vec<char> = s.chars().collect();
    let p_chars: Vec<char> = pattern.chars().collect();
    like_match_impl(&s_chars, &p_chars)
}

fn like_match_impl(s: &[char], p: &[char]) -> bool {
    if p.is_empty() {
        return s.is_empty();
    }

    match p[0] {
        '%' => (0..=s.len()).any(|i| like_match_impl(&s[i..], &p[1..])),
        '_' => !s.is_empty() && like_match_impl(&s[1..], &p[1..]),
        '\\' if p.len() > 1 => !s.is_empty() && s[0] == p[1] && like_match_impl(&s[1..], &p[2..]),
        c => !s.is_empty() && s[0] == c && like_match_impl(&s[1..], &p[1..]),
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order used by indexes, buffers and key tuples: NULL sorts first.
impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Null, _) => Ordering::Less,
            (_, Datum::Null) => Ordering::Greater,

            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Float(a), Datum::Float(b)) => a.total_cmp(b),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.cmp(b),

            // Cross-type numeric comparisons
            (Datum::Int(a), Datum::Float(b)) => (*a as f64).total_cmp(b),
            (Datum::Float(a), Datum::Int(b)) => a.total_cmp(&(*b as f64)),

            _ => self.type_tag().cmp(&other.type_tag()),
        }
    }
}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_tag().hash(state);
        match self {
            Datum::Null => {}
            Datum::Bool(b) => b.hash(state),
            // Int and integral Float compare equal, so they must hash alike
            Datum::Int(i) => (*i as f64).to_bits().hash(state),
            Datum::Float(f) => f.to_bits().hash(state),
            Datum::String(s) => s.hash(state),
            Datum::Timestamp(t) => t.hash(state),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Int(i64::from(v))
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float(v)
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Bool(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::String(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::String(v)
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(v: Option<T>) -> Self {
        v.map_or(Datum::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_null_sorts_first_but_compares_unknown() {
        assert!(Datum::Null < Datum::Int(i64::MIN));
        assert_eq!(Datum::Null.sql_cmp(&Datum::Int(1)), None);
        assert_eq!(Datum::Int(1).sql_cmp(&Datum::Int(2)), Some(Ordering::Less));
    }

    #[test]
    fn test_numeric_cross_type_hash() {
        let mut set = HashSet::new();
        set.insert(Datum::Int(3));
        assert!(set.contains(&Datum::Float(3.0)));
        assert!(!set.contains(&Datum::Float(3.5)));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Datum::from(7i64).as_int(), Some(7));
        assert_eq!(Datum::from("x").as_str(), Some("x"));
        assert!(Datum::from(None::<i64>).is_null());
        assert_eq!(Datum::Bool(true).as_int(), Some(1));
        assert_eq!(Datum::Float(2.5).as_int(), Some(2));
    }

    #[test]
    fn test_datum_like() {
        let s = Datum::from("hello world");
        assert_eq!(s.like(&Datum::from("hello%")), Some(Datum::Bool(true)));
        assert_eq!(s.like(&Datum::from("h_llo%")), Some(Datum::Bool(true)));
        assert_eq!(s.like(&Datum::from("world")), Some(Datum::Bool(false)));
        assert_eq!(s.like(&Datum::Null), Some(Datum::Null));
    }

    #[test]
    fn test_contains_words() {
        let doc = Datum::from("The quick brown Fox");
        assert!(doc.contains_words("fox quick"));
        assert!(!doc.contains_words("fox cat"));
        assert!(!doc.contains_words("  "));
        assert!(!Datum::Null.contains_words("fox"));
    }

    #[test]
    fn test_negate_and_not() {
        assert_eq!(Datum::Int(5).negate(), Some(Datum::Int(-5)));
        assert_eq!(Datum::Bool(false).not(), Some(Datum::Bool(true)));
        assert_eq!(Datum::from("s").negate(), None);
    }
}
