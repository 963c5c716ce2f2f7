//! Query grammar parsing.
//!
//! The query language is a small boolean language over text terms and field
//! filters:
//!
//! ```text
//! query     := or_group ( ("|" | "OR") or_group )*
//! or_group  := clause+                       (juxtaposition = AND)
//! clause    := "-"? ( field ":" value | quoted | word )
//! value     := "=" word_or_quoted            exact
//!            | (">" | "<" | ">=" | "<=") n   numeric comparison
//!            | n "-" m                       inclusive numeric range
//!            | '""'                          field present but empty
//!            | word_or_quoted                substring
//! ```
//!
//! `OR` is only a keyword in uppercase. Negation binds to the single clause
//! that follows it. Errors carry the byte offset and the offending fragment.

use crate::error::{MetacacheError, Result};
use crate::types::Field;
use std::fmt;
use std::mem;

/// How a field filter compares its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Case-insensitive substring
    Contains,
    /// Case-insensitive equality
    Exact,
    Gt,
    Lt,
    Gte,
    Lte,
    /// Inclusive `value..=value_end`
    Range,
    /// Field appeared in the log but has no surviving value
    Empty,
}

/// A free-text term matched against the full-text index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTerm {
    pub value: String,
    pub negated: bool,
}

/// A `field:value` filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub field: Field,
    pub operator: FilterOperator,
    pub value: String,
    /// Upper bound for `Range`
    pub value_end: Option<String>,
    pub negated: bool,
}

impl FieldFilter {
    pub fn new(field: Field, operator: FilterOperator, value: impl Into<String>) -> Self {
        FieldFilter {
            field,
            operator,
            value: value.into(),
            value_end: None,
            negated: false,
        }
    }

    /// The explicit "file is available locally" condition
    pub fn present() -> Self {
        Self::new(Field::Present, FilterOperator::Exact, "true")
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }
}

/// One AND-ed clause of an `OrGroup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    Text(TextTerm),
    Filter(FieldFilter),
}

impl Clause {
    pub fn is_negated(&self) -> bool {
        match self {
            Clause::Text(term) => term.negated,
            Clause::Filter(filter) => filter.negated,
        }
    }
}

/// Clauses that must all match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrGroup {
    pub clauses: Vec<Clause>,
}

/// A parsed query: an item matches if any group matches.
///
/// Zero groups (or a single empty group) match every item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub groups: Vec<OrGroup>,
}

impl SearchQuery {
    /// Query matching every item
    pub fn all() -> Self {
        SearchQuery::default()
    }

    /// True if this query places no condition on items
    pub fn is_match_all(&self) -> bool {
        self.groups.iter().all(|g| g.clauses.is_empty())
    }

    /// Restrict every group to items whose file is present locally.
    pub fn require_present(mut self) -> Self {
        if self.groups.is_empty() {
            self.groups.push(OrGroup::default());
        }
        for group in &mut self.groups {
            group.clauses.push(Clause::Filter(FieldFilter::present()));
        }
        self
    }
}

/// Parse a query string into a `SearchQuery`.
pub fn parse_query(input: &str) -> Result<SearchQuery> {
    Parser { input, pos: 0 }.parse()
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        while self.peek().map_or(false, char::is_whitespace) {
            self.bump();
        }
    }

    fn at_boundary(&self) -> bool {
        match self.peek() {
            None | Some('|') => true,
            Some(c) => c.is_whitespace(),
        }
    }

    /// Length of the separator at the cursor, if any.
    fn separator_len(&self) -> Option<usize> {
        let rest = self.rest();
        if rest.starts_with('|') {
            return Some(1);
        }
        let after = rest.strip_prefix("OR")?;
        match after.chars().next() {
            None | Some('|') => Some(2),
            Some(c) if c.is_whitespace() => Some(2),
            _ => None,
        }
    }

    fn error(&self, start: usize, reason: impl Into<String>) -> MetacacheError {
        let end = self.input[start..]
            .find(char::is_whitespace)
            .map_or(self.input.len(), |i| start + i);
        MetacacheError::query(start, &self.input[start..end], reason)
    }

    fn parse(mut self) -> Result<SearchQuery> {
        let mut groups = Vec::new();
        let mut clauses = Vec::new();
        let mut dangling_separator = None;

        loop {
            self.skip_whitespace();
            if self.peek().is_none() {
                break;
            }

            let start = self.pos;
            if let Some(len) = self.separator_len() {
                if clauses.is_empty() {
                    return Err(self.error(start, "OR separator without a preceding clause"));
                }
                groups.push(OrGroup {
                    clauses: mem::take(&mut clauses),
                });
                self.pos += len;
                dangling_separator = Some(start);
                continue;
            }

            clauses.push(self.parse_clause()?);
            dangling_separator = None;
        }

        if let Some(start) = dangling_separator {
            return Err(self.error(start, "OR separator without a following clause"));
        }
        if !clauses.is_empty() {
            groups.push(OrGroup { clauses });
        }

        Ok(SearchQuery { groups })
    }

    fn parse_clause(&mut self) -> Result<Clause> {
        let start = self.pos;

        let negated = self.peek() == Some('-');
        if negated {
            self.bump();
            if self.at_boundary() {
                return Err(self.error(start, "negation must be followed by a term"));
            }
        }

        if self.peek() == Some('"') {
            let value = self.parse_quoted()?;
            return Ok(Clause::Text(TextTerm { value, negated }));
        }

        if let Some(name) = self.field_prefix() {
            let name_pos = self.pos;
            let field = Field::from_name(name).ok_or_else(|| MetacacheError::UnknownField {
                field: name.to_string(),
                position: name_pos,
            })?;
            self.pos += name.len() + 1;
            let mut filter = self.parse_filter_value(field, start)?;
            filter.negated = negated;
            return Ok(Clause::Filter(filter));
        }

        let value = self.take_word().to_string();
        Ok(Clause::Text(TextTerm { value, negated }))
    }

    /// An identifier followed by `:` at the cursor.
    fn field_prefix(&self) -> Option<&'a str> {
        let rest = self.rest();
        let mut chars = rest.char_indices();

        match chars.next() {
            Some((_, c)) if c.is_ascii_alphabetic() => {}
            _ => return None,
        }

        for (i, c) in chars {
            if c == ':' {
                return Some(&rest[..i]);
            }
            if !(c.is_ascii_alphanumeric() || c == '_') {
                return None;
            }
        }
        None
    }

    fn take_word(&mut self) -> &'a str {
        let start = self.pos;
        while !self.at_boundary() {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    fn parse_quoted(&mut self) -> Result<String> {
        let start = self.pos;
        self.bump();

        match self.rest().find('"') {
            Some(len) => {
                let value = self.rest()[..len].to_string();
                self.pos += len + 1;
                Ok(value)
            }
            None => Err(MetacacheError::query(
                start,
                &self.input[start..],
                format!("unclosed quote starting at position {}", start),
            )),
        }
    }

    fn parse_value(&mut self, clause_start: usize, missing: &str) -> Result<String> {
        if self.peek() == Some('"') {
            return self.parse_quoted();
        }
        if self.at_boundary() {
            return Err(self.error(clause_start, missing));
        }
        Ok(self.take_word().to_string())
    }

    fn parse_filter_value(&mut self, field: Field, clause_start: usize) -> Result<FieldFilter> {
        let value_start = self.pos;
        let rest = self.rest();

        let mut filter = match self.peek() {
            Some('"') => {
                let value = self.parse_quoted()?;
                if value.is_empty() {
                    FieldFilter::new(field, FilterOperator::Empty, "")
                } else {
                    FieldFilter::new(field, FilterOperator::Contains, value)
                }
            }
            Some('=') => {
                self.bump();
                let value = self.parse_value(clause_start, "missing value after '='")?;
                FieldFilter::new(field, FilterOperator::Exact, value)
            }
            Some('>') | Some('<') => {
                let (operator, len) = if rest.starts_with(">=") {
                    (FilterOperator::Gte, 2)
                } else if rest.starts_with("<=") {
                    (FilterOperator::Lte, 2)
                } else if rest.starts_with('>') {
                    (FilterOperator::Gt, 1)
                } else {
                    (FilterOperator::Lt, 1)
                };
                self.pos += len;

                if !field.is_numeric() {
                    return Err(self.error(
                        clause_start,
                        format!("field '{}' does not support numeric comparison", field),
                    ));
                }
                let value = self.parse_value(clause_start, "missing number after comparison")?;
                if parse_number(&value).is_none() {
                    return Err(self.error(
                        value_start,
                        format!("expected a number, found {:?}", value),
                    ));
                }
                FieldFilter::new(field, operator, value)
            }
            _ => {
                if self.at_boundary() {
                    return Err(self.error(
                        clause_start,
                        format!("missing value for field '{}'", field),
                    ));
                }
                let word = self.take_word();
                match split_range(word).filter(|_| field.is_numeric()) {
                    Some((low, high)) => {
                        if parse_number(low) > parse_number(high) {
                            return Err(self.error(
                                value_start,
                                format!("range start {} is greater than its end {}", low, high),
                            ));
                        }
                        let mut filter = FieldFilter::new(field, FilterOperator::Range, low);
                        filter.value_end = Some(high.to_string());
                        filter
                    }
                    None => FieldFilter::new(field, FilterOperator::Contains, word),
                }
            }
        };

        if field == Field::Present {
            if filter.operator == FilterOperator::Empty {
                return Err(self.error(clause_start, "presence is never empty"));
            }
            let flag = parse_flag(&filter.value).ok_or_else(|| {
                self.error(value_start, "presence expects true/false, yes/no or 1/0")
            })?;
            filter.operator = FilterOperator::Exact;
            filter.value = flag.to_string();
        }

        Ok(filter)
    }
}

/// Parse a numeric filter value; all numeric fields compare as floating point.
pub(crate) fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn split_range(word: &str) -> Option<(&str, &str)> {
    word.char_indices()
        .skip(1)
        .filter(|(_, c)| *c == '-')
        .map(|(i, _)| (&word[..i], &word[i + 1..]))
        .find(|(low, high)| parse_number(low).is_some() && parse_number(high).is_some())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value.starts_with(['-', '=', '<', '>'])
        || value.contains(|c: char| c.is_whitespace() || c == '|' || c == ':')
        || value == "OR"
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    if needs_quotes(value) {
        write!(f, "\"{}\"", value)
    } else {
        f.write_str(value)
    }
}

impl fmt::Display for TextTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("-")?;
        }
        write_value(f, &self.value)
    }
}

impl fmt::Display for FieldFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("-")?;
        }
        write!(f, "{}:", self.field)?;
        match self.operator {
            FilterOperator::Contains => write_value(f, &self.value),
            FilterOperator::Exact => {
                f.write_str("=")?;
                write_value(f, &self.value)
            }
            FilterOperator::Gt => write!(f, ">{}", self.value),
            FilterOperator::Lt => write!(f, "<{}", self.value),
            FilterOperator::Gte => write!(f, ">={}", self.value),
            FilterOperator::Lte => write!(f, "<={}", self.value),
            FilterOperator::Range => write!(
                f,
                "{}-{}",
                self.value,
                self.value_end.as_deref().unwrap_or(&self.value)
            ),
            FilterOperator::Empty => f.write_str("\"\""),
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Text(term) => term.fmt(f),
            Clause::Filter(filter) => filter.fmt(f),
        }
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            for (j, clause) in group.clauses.iter().enumerate() {
                if j > 0 {
                    f.write_str(" ")?;
                }
                clause.fmt(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> Clause {
        Clause::Text(TextTerm {
            value: value.to_string(),
            negated: false,
        })
    }

    fn only_filter(query: &str) -> FieldFilter {
        let parsed = parse_query(query).unwrap();
        assert_eq!(parsed.groups.len(), 1, "query {:?}", query);
        match &parsed.groups[0].clauses[..] {
            [Clause::Filter(filter)] => filter.clone(),
            other => panic!("expected a single filter, got {:?}", other),
        }
    }

    #[test]
    fn test_and_or_precedence() {
        let parsed = parse_query("a b | c d").unwrap();
        assert_eq!(
            parsed,
            SearchQuery {
                groups: vec![
                    OrGroup {
                        clauses: vec![text("a"), text("b")]
                    },
                    OrGroup {
                        clauses: vec![text("c"), text("d")]
                    },
                ]
            }
        );

        assert_eq!(parse_query("a b OR c d").unwrap(), parsed);
    }

    #[test]
    fn test_lowercase_or_is_a_word() {
        let parsed = parse_query("a or b").unwrap();
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(parsed.groups[0].clauses, vec![text("a"), text("or"), text("b")]);

        // Only a standalone OR separates groups.
        let parsed = parse_query("ORBIT").unwrap();
        assert_eq!(parsed.groups[0].clauses, vec![text("ORBIT")]);
    }

    #[test]
    fn test_negation_binds_to_one_clause() {
        let parsed = parse_query("-a b").unwrap();
        let clauses = &parsed.groups[0].clauses;
        assert!(clauses[0].is_negated());
        assert!(!clauses[1].is_negated());

        let filter = only_filter("-genre:progressive");
        assert!(filter.negated);
        assert_eq!(filter.field, Field::Genre);
        assert_eq!(filter.operator, FilterOperator::Contains);
        assert_eq!(filter.value, "progressive");
    }

    #[test]
    fn test_filter_operators() {
        let range = only_filter("bpm:140-160");
        assert_eq!(range.operator, FilterOperator::Range);
        assert_eq!(range.value, "140");
        assert_eq!(range.value_end.as_deref(), Some("160"));

        assert_eq!(only_filter("bpm:>=140").operator, FilterOperator::Gte);
        assert_eq!(only_filter("bpm:<=140").operator, FilterOperator::Lte);
        assert_eq!(only_filter("rating:>3").operator, FilterOperator::Gt);
        assert_eq!(only_filter("year:<2000").operator, FilterOperator::Lt);

        let exact = only_filter("artist:=Alpha");
        assert_eq!(exact.operator, FilterOperator::Exact);
        assert_eq!(exact.value, "Alpha");

        let empty = only_filter("crate:\"\"");
        assert_eq!(empty.operator, FilterOperator::Empty);
        assert_eq!(empty.field, Field::Crate);

        let quoted = only_filter("genre:\"deep house\"");
        assert_eq!(quoted.operator, FilterOperator::Contains);
        assert_eq!(quoted.value, "deep house");

        let exact_quoted = only_filter("title:=\"Night Drive\"");
        assert_eq!(exact_quoted.operator, FilterOperator::Exact);
        assert_eq!(exact_quoted.value, "Night Drive");
    }

    #[test]
    fn test_ranges_only_apply_to_numeric_fields() {
        let filter = only_filter("artist:jay-z");
        assert_eq!(filter.operator, FilterOperator::Contains);
        assert_eq!(filter.value, "jay-z");

        let filter = only_filter("title:1-2");
        assert_eq!(filter.operator, FilterOperator::Contains);

        let filter = only_filter("bpm:120.5-130");
        assert_eq!(filter.operator, FilterOperator::Range);
        assert_eq!(filter.value, "120.5");
    }

    #[test]
    fn test_field_aliases_and_presence() {
        assert_eq!(only_filter("initialkey:8A").field, Field::MusicalKey);
        assert_eq!(only_filter("CRATES:warmup").field, Field::Crate);

        let present = only_filter("present:yes");
        assert_eq!(present, FieldFilter::present());

        let absent = only_filter("-present:0");
        assert_eq!(absent.value, "false");
        assert!(absent.negated);

        assert!(parse_query("present:maybe").is_err());
    }

    #[test]
    fn test_quoted_text_terms() {
        let parsed = parse_query("\"night drive\" -\"day\"").unwrap();
        assert_eq!(
            parsed.groups[0].clauses,
            vec![
                text("night drive"),
                Clause::Text(TextTerm {
                    value: "day".to_string(),
                    negated: true
                })
            ]
        );
    }

    #[test]
    fn test_unclosed_quote() {
        let err = parse_query("artist:Alpha \"deep").unwrap_err();
        match err {
            MetacacheError::QueryParse {
                position,
                fragment,
                reason,
            } => {
                assert_eq!(position, 13);
                assert_eq!(fragment, "\"deep");
                assert_eq!(reason, "unclosed quote starting at position 13");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_field() {
        let err = parse_query("a mood:dark").unwrap_err();
        assert!(matches!(
            err,
            MetacacheError::UnknownField { ref field, position: 2 } if field == "mood"
        ));
    }

    #[test]
    fn test_invalid_queries() {
        for query in [
            "title:>3",
            "bpm:>fast",
            "bpm:160-140",
            "genre:",
            "artist:=",
            "a -",
            "| a",
            "a |",
            "a | | b",
            "a OR",
        ] {
            let err = parse_query(query).unwrap_err();
            assert!(err.is_query_error(), "query {:?} gave {:?}", query, err);
        }
    }

    #[test]
    fn test_empty_query_matches_all() {
        assert!(parse_query("").unwrap().is_match_all());
        assert!(parse_query("   ").unwrap().groups.is_empty());
        assert!(!parse_query("a").unwrap().is_match_all());
    }

    #[test]
    fn test_require_present() {
        let query = parse_query("a | b").unwrap().require_present();
        for group in &query.groups {
            assert_eq!(
                group.clauses.last(),
                Some(&Clause::Filter(FieldFilter::present()))
            );
        }

        let all = SearchQuery::all().require_present();
        assert_eq!(all.groups.len(), 1);
        assert!(!all.is_match_all());
    }

    #[test]
    fn test_display_reparses() {
        let input = "artist:=\"Night Drive\" -genre:psy bpm:140-160 | crate:\"\" \"two words\" rating:>=4";
        let parsed = parse_query(input).unwrap();
        let rendered = parsed.to_string();
        assert_eq!(parse_query(&rendered).unwrap(), parsed);
        assert_eq!(
            rendered,
            "artist:=\"Night Drive\" -genre:psy bpm:140-160 | crate:\"\" \"two words\" rating:>=4"
        );
    }
}
