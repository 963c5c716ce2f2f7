//! Query compilation and execution against the cache.
//!
//! A `SearchQuery` compiles to a single SQL `WHERE` expression over the
//! `items` table:
//!
//! - text terms become prefix matches against the FTS5 index
//! - field filters become column comparisons, semi-joins against the
//!   membership table, or lookups in `empty_fields`
//! - clauses in a group are AND-ed, groups are OR-ed
//!
//! Every leaf predicate is wrapped in `COALESCE(.., 0)` so it is never NULL.
//! A filter and its negation therefore partition the item set exactly.
//!
//! Substring and equality tests compare through the cache's fold function
//! rather than `LIKE`/`NOCASE`, which only fold ASCII.
//!
//! Nothing here filters on presence implicitly: items whose file is absent
//! are returned like any other unless the query asks for `present:true`.

use crate::cache::{self, fold_case, CacheStore, FOLD_FUNCTION};
use crate::error::Result;
use crate::query::{parse_number, Clause, FieldFilter, FilterOperator, SearchQuery, TextTerm};
use crate::types::{Field, FieldKind, Item};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use std::fmt::Write;
use tracing::{debug, instrument};

/// A query lowered to a `WHERE` expression with `?N` placeholders.
#[derive(Debug, Clone, PartialEq)]
struct CompiledQuery {
    condition: String,
    params: Vec<Value>,
}

fn compile(query: &SearchQuery) -> CompiledQuery {
    let mut compiler = Compiler { params: Vec::new() };
    let condition = compiler.query(query);
    CompiledQuery {
        condition,
        params: compiler.params,
    }
}

/// Run a query and return every matching item, in insertion order.
pub fn execute_search(cache: &CacheStore, query: &SearchQuery) -> Result<Vec<Item>> {
    execute_search_limited(cache, query, None)
}

/// Run a query, returning at most `limit` items.
#[instrument(skip_all, fields(query = %query))]
pub fn execute_search_limited(
    cache: &CacheStore,
    query: &SearchQuery,
    limit: Option<usize>,
) -> Result<Vec<Item>> {
    let compiled = compile(query);

    let mut sql = format!(
        "SELECT {} FROM items WHERE {} ORDER BY items.id",
        cache::ITEM_COLUMNS,
        compiled.condition
    );
    if let Some(limit) = limit {
        let _ = write!(sql, " LIMIT {}", limit);
    }

    debug!(sql = %sql, params = compiled.params.len(), "Executing search");

    let mut items = run(cache, &sql, &compiled.params).map_err(|e| cache.classify(e))?;
    cache.attach_memberships(&mut items)?;

    debug!(results = items.len(), "Search complete");
    Ok(items)
}

/// Number of items matching a query.
pub fn count_matches(cache: &CacheStore, query: &SearchQuery) -> Result<u64> {
    let compiled = compile(query);
    let sql = format!("SELECT COUNT(*) FROM items WHERE {}", compiled.condition);

    let count: i64 = cache
        .connection()
        .query_row(&sql, params_from_iter(compiled.params.iter()), |row| {
            row.get(0)
        })
        .map_err(|e| cache.classify(e.into()))?;
    Ok(count.max(0) as u64)
}

fn run(cache: &CacheStore, sql: &str, params: &[Value]) -> Result<Vec<Item>> {
    let mut stmt = cache.connection().prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), cache::item_from_row)?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

struct Compiler {
    params: Vec<Value>,
}

impl Compiler {
    /// Bind a value and return its placeholder.
    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    fn bind_text(&mut self, value: &str) -> String {
        self.bind(Value::Text(value.to_string()))
    }

    fn query(&mut self, query: &SearchQuery) -> String {
        if query.is_match_all() {
            return "1".to_string();
        }

        let groups: Vec<String> = query
            .groups
            .iter()
            .map(|group| {
                if group.clauses.is_empty() {
                    return "1".to_string();
                }
                let clauses: Vec<String> = group.clauses.iter().map(|c| self.clause(c)).collect();
                format!("({})", clauses.join(" AND "))
            })
            .collect();

        groups.join(" OR ")
    }

    fn clause(&mut self, clause: &Clause) -> String {
        let (predicate, negated) = match clause {
            Clause::Text(term) => (self.text_term(term), term.negated),
            Clause::Filter(filter) => (self.field_filter(filter), filter.negated),
        };

        if negated {
            format!("NOT COALESCE({}, 0)", predicate)
        } else {
            format!("COALESCE({}, 0)", predicate)
        }
    }

    fn text_term(&mut self, term: &TextTerm) -> String {
        let value = term.value.trim();
        if value.is_empty() {
            return "1".to_string();
        }

        if !value.chars().any(char::is_alphanumeric) {
            // Punctuation-only terms produce no FTS tokens; fall back to a
            // substring scan of the indexed columns.
            let needle = self.bind_text(&fold_case(value));
            let columns: Vec<String> = Field::TEXT_INDEXED
                .iter()
                .chain(std::iter::once(&Field::Path))
                .filter_map(|f| f.column())
                .map(|col| format!("instr({}(items.{}), {}) > 0", FOLD_FUNCTION, col, needle))
                .collect();
            return format!("({})", columns.join(" OR "));
        }

        let matcher = self.bind_text(&fts_prefix_phrase(value));
        format!(
            "(items.id IN (SELECT rowid FROM items_fts WHERE items_fts MATCH {}))",
            matcher
        )
    }

    fn field_filter(&mut self, filter: &FieldFilter) -> String {
        if filter.operator == FilterOperator::Empty {
            let field = self.bind_text(filter.field.name());
            return format!(
                "EXISTS (SELECT 1 FROM empty_fields e WHERE e.item_id = items.id AND e.field = {})",
                field
            );
        }

        match filter.field.kind() {
            FieldKind::Presence => {
                let flag = filter.value == "true";
                format!("items.present = {}", i64::from(flag))
            }
            FieldKind::Group => self.membership(filter),
            FieldKind::Path => {
                let column = filter.field.column().unwrap_or("path");
                self.compare(&format!("items.{}", column), filter)
            }
            FieldKind::Text | FieldKind::Real | FieldKind::Integer => {
                let column = match filter.field.column() {
                    Some(column) => format!("items.{}", column),
                    None => return self.membership(filter),
                };
                let scalar = self.compare(&column, filter);
                let multi = self.membership(filter);
                format!("({} OR {})", scalar, multi)
            }
        }
    }

    /// Semi-join against per-value rows of the field.
    fn membership(&mut self, filter: &FieldFilter) -> String {
        let field = self.bind_text(filter.field.name());
        let predicate = self.compare("m.value", filter);
        format!(
            "EXISTS (SELECT 1 FROM memberships m WHERE m.item_id = items.id AND m.field = {} AND {})",
            field, predicate
        )
    }

    /// Compare an expression holding the field's value against the filter.
    fn compare(&mut self, expr: &str, filter: &FieldFilter) -> String {
        let numeric = filter.field.is_numeric();
        let as_real = format!("CAST({} AS REAL)", expr);
        let as_text = format!("CAST({} AS TEXT)", expr);

        match filter.operator {
            FilterOperator::Contains => {
                let needle = self.bind_text(&fold_case(&filter.value));
                let target = if numeric { as_text.as_str() } else { expr };
                format!("instr({}({}), {}) > 0", FOLD_FUNCTION, target, needle)
            }
            FilterOperator::Exact => match parse_number(&filter.value).filter(|_| numeric) {
                Some(number) => {
                    let value = self.bind(Value::Real(number));
                    format!("({} IS NOT NULL AND {} = {})", expr, as_real, value)
                }
                None => {
                    let value = self.bind_text(&fold_case(&filter.value));
                    let target = if numeric { as_text.as_str() } else { expr };
                    format!("{}({}) = {}", FOLD_FUNCTION, target, value)
                }
            },
            FilterOperator::Gt | FilterOperator::Lt | FilterOperator::Gte | FilterOperator::Lte => {
                let op = match filter.operator {
                    FilterOperator::Gt => ">",
                    FilterOperator::Lt => "<",
                    FilterOperator::Gte => ">=",
                    _ => "<=",
                };
                let value = self.bind_number(&filter.value);
                format!("({} IS NOT NULL AND {} {} {})", expr, as_real, op, value)
            }
            FilterOperator::Range => {
                let low = self.bind_number(&filter.value);
                let high = self.bind_number(filter.value_end.as_deref().unwrap_or(&filter.value));
                format!(
                    "({} IS NOT NULL AND {} BETWEEN {} AND {})",
                    expr, as_real, low, high
                )
            }
            // Handled before column dispatch.
            FilterOperator::Empty => "0".to_string(),
        }
    }

    fn bind_number(&mut self, value: &str) -> String {
        match parse_number(value) {
            Some(number) => self.bind(Value::Real(number)),
            None => self.bind(Value::Null),
        }
    }
}

/// Quote a term as an FTS5 phrase with a prefix match on its last token.
fn fts_prefix_phrase(value: &str) -> String {
    format!("\"{}\"*", value.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoProgress;
    use crate::memory::MemoryLogStore;
    use crate::builder::build_cache;
    use crate::query::parse_query;
    use crate::types::Key;

    fn build(store: &MemoryLogStore) -> CacheStore {
        let mut cache = CacheStore::open_in_memory().unwrap();
        build_cache(&mut cache, store, &NoProgress).unwrap();
        cache
    }

    fn keys(cache: &CacheStore, query: &str) -> Vec<String> {
        let query = parse_query(query).unwrap();
        execute_search(cache, &query)
            .unwrap()
            .into_iter()
            .map(|item| item.key.0)
            .collect()
    }

    fn library() -> MemoryLogStore {
        let store = MemoryLogStore::new();
        store.put(
            "k1",
            "1000s artist +Alpha title +Night_Drive genre +psy bpm +120 rating +5 year +1999\n",
            "music/alpha/night.flac",
            true,
        );
        store.put(
            "k2",
            "1000s artist +Beta genre +psy +progressive bpm +145 crate +warmup\n",
            "music/beta/rise.mp3",
            false,
        );
        store.put(
            "k3",
            "1000s artist +Gamma genre +techno bpm +160 crate +x\n2000s crate -x\n",
            "music/gamma/drop.mp3",
            true,
        );
        store.put(
            "k4",
            "1000s artist +Delta genre +hardcore bpm +200 comment +!ZGVlcCBjdXQ=\n",
            "music/delta/fast.mp3",
            false,
        );
        store
    }

    #[test]
    fn test_bpm_range() {
        let cache = build(&library());
        assert_eq!(keys(&cache, "bpm:140-160"), vec!["k2", "k3"]);
    }

    #[test]
    fn test_genre_negation() {
        let cache = build(&library());
        assert_eq!(keys(&cache, "genre:psy -genre:progressive"), vec!["k1"]);
    }

    #[test]
    fn test_empty_crate() {
        let cache = build(&library());
        // k3's crate was added then removed; k1 and k4 never had one.
        assert_eq!(keys(&cache, "crate:\"\""), vec!["k3"]);
        assert_eq!(keys(&cache, "-crate:\"\""), vec!["k1", "k2", "k4"]);
    }

    #[test]
    fn test_absent_items_are_returned() {
        let cache = build(&library());
        assert_eq!(keys(&cache, "artist:beta"), vec!["k2"]);
        assert_eq!(keys(&cache, "bpm:>=100"), vec!["k1", "k2", "k3", "k4"]);

        let present_only = parse_query("bpm:>=100").unwrap().require_present();
        let found: Vec<String> = execute_search(&cache, &present_only)
            .unwrap()
            .into_iter()
            .map(|i| i.key.0)
            .collect();
        assert_eq!(found, vec!["k1", "k3"]);
    }

    #[test]
    fn test_negation_partitions_items() {
        let cache = build(&library());
        let total = cache.item_count().unwrap();

        for filter in [
            "genre:psy",
            "bpm:140-160",
            "bpm:>150",
            "rating:<=4",
            "crate:warmup",
            "crate:\"\"",
            "comment:deep",
            "year:=1999",
            "artist:=alpha",
            "present:true",
            "path:beta",
            "title:drive",
            "night",
        ] {
            let positive = count_matches(&cache, &parse_query(filter).unwrap()).unwrap();
            let negative =
                count_matches(&cache, &parse_query(&format!("-{}", filter)).unwrap()).unwrap();
            assert_eq!(positive + negative, total, "filter {:?}", filter);

            let both = parse_query(&format!("{} -{}", filter, filter)).unwrap();
            assert_eq!(count_matches(&cache, &both).unwrap(), 0, "filter {:?}", filter);
        }
    }

    #[test]
    fn test_text_terms_use_prefix_matching() {
        let cache = build(&library());
        assert_eq!(keys(&cache, "gam"), vec!["k3"]);
        assert_eq!(keys(&cache, "techno"), vec!["k3"]);
        // Path is indexed too
        assert_eq!(keys(&cache, "rise"), vec!["k2"]);
        assert_eq!(keys(&cache, "-psy"), vec!["k3", "k4"]);
        assert_eq!(keys(&cache, "\"\""), vec!["k1", "k2", "k3", "k4"]);
    }

    #[test]
    fn test_or_groups() {
        let cache = build(&library());
        assert_eq!(keys(&cache, "artist:alpha | artist:delta"), vec!["k1", "k4"]);
        assert_eq!(
            keys(&cache, "genre:techno bpm:>150 OR crate:warmup"),
            vec!["k2", "k3"]
        );
    }

    #[test]
    fn test_exact_and_contains() {
        let cache = build(&library());
        assert_eq!(keys(&cache, "artist:=ALPHA"), vec!["k1"]);
        assert_eq!(keys(&cache, "artist:=alp"), Vec::<String>::new());
        assert_eq!(keys(&cache, "artist:LP"), vec!["k1"]);
        assert_eq!(keys(&cache, "genre:=progressive"), vec!["k2"]);
        assert_eq!(keys(&cache, "bpm:=145"), vec!["k2"]);
        assert_eq!(keys(&cache, "crate:=warmup"), vec!["k2"]);
        assert_eq!(keys(&cache, "comment:\"deep cut\""), vec!["k4"]);
        // SQL wildcard characters in values are literal
        assert_eq!(keys(&cache, "title:Night_D"), vec!["k1"]);
        assert_eq!(keys(&cache, "title:%"), Vec::<String>::new());
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let cache = build(&library());
        assert_eq!(keys(&cache, ""), vec!["k1", "k2", "k3", "k4"]);
        assert_eq!(count_matches(&cache, &SearchQuery::all()).unwrap(), 4);
    }

    #[test]
    fn test_results_include_memberships_and_limit() {
        let cache = build(&library());
        let query = parse_query("crate:warmup").unwrap();
        let items = execute_search(&cache, &query).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, Key::new("k2"));
        assert_eq!(items[0].crates(), ["warmup".to_string()]);

        let limited = execute_search_limited(&cache, &SearchQuery::all(), Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].key, Key::new("k1"));
    }

    #[test]
    fn test_fts_prefix_phrase_quotes() {
        assert_eq!(fts_prefix_phrase("say \"hi\""), "\"say \"\"hi\"\"\"*");
    }

    #[test]
    fn test_case_folding_beyond_ascii() {
        let store = MemoryLogStore::new();
        store.put(
            "k1",
            "1000s artist +Ölafur genre +Électro crate +Été\n",
            "music/o.flac",
            true,
        );
        store.put("k2", "1000s artist +Oskar genre +electro\n", "music/k.flac", true);
        let cache = build(&store);

        assert_eq!(keys(&cache, "artist:ölafur"), vec!["k1"]);
        assert_eq!(keys(&cache, "artist:ÖLAF"), vec!["k1"]);
        assert_eq!(keys(&cache, "genre:=électro"), vec!["k1"]);
        assert_eq!(keys(&cache, "genre:=ÉLECTRO"), vec!["k1"]);
        assert_eq!(keys(&cache, "crate:=été"), vec!["k1"]);
        assert_eq!(keys(&cache, "crate:ÉT"), vec!["k1"]);
        assert_eq!(keys(&cache, "-artist:ölafur"), vec!["k2"]);
        // Both matching paths agree
        assert_eq!(keys(&cache, "ölafur"), keys(&cache, "artist:ölafur"));
    }

    #[test]
    fn test_punctuation_term_scans_columns() {
        let cache = build(&library());
        assert_eq!(keys(&cache, "_"), vec!["k1"]);
        assert_eq!(keys(&cache, "%"), Vec::<String>::new());
    }
}
