//! Query engine
//!
//! Structured queries over the index store: free-text name matching
//! (exact/prefix/substring/fuzzy/glob) plus metadata filters. Filters are
//! applied before text ranking so a narrow `ext:` or `size:` clause keeps
//! substring scoring off the full name table. Results are bounded, ranked by
//! match quality, ties broken by fewer path components then name.
//!
//! Reads are snapshot-consistent: candidates come from the secondary indexes
//! under a briefly-held read lock and entries from the sharded map, so a
//! query never blocks on the indexer. Staleness is at most the batch the
//! indexer is currently applying.

use crate::index::entry::IndexEntry;
use crate::index::store::IndexStore;
use crate::ntfs::structs::file_attributes;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

// ============================================================================
// Query model
// ============================================================================

/// How the free-text fragment matches leaf names (always case-insensitive)
#[derive(Debug, Clone)]
pub enum TextMatch {
    Exact,
    Prefix,
    Substring,
    Fuzzy,
    Glob(Regex),
}

/// Metadata filters, applied before ranking
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Lowercase extensions without the dot
    pub extensions: Option<Vec<String>>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    /// Entries must carry all of these attribute bits
    pub attribute_mask: u32,
}

impl QueryFilter {
    fn uses_secondary_indexes(&self) -> bool {
        self.extensions.is_some()
            || self.min_size.is_some()
            || self.max_size.is_some()
            || self.modified_after.is_some()
            || self.modified_before.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    /// Lowercased free-text fragment; may be empty for pure filter queries
    pub text: String,
    pub match_mode: TextMatch,
    pub filter: QueryFilter,
}

impl Query {
    pub fn substring(text: &str) -> Self {
        Self {
            text: text.to_lowercase(),
            match_mode: TextMatch::Substring,
            filter: QueryFilter::default(),
        }
    }
}

/// One ranked result
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: IndexEntry,
    /// Resolved path, `/`-joined from the volume root
    pub path: String,
    pub score: u32,
}

// ============================================================================
// Query string parsing
// ============================================================================

/// Parse an Everything-style query string.
///
/// Recognized clauses: `ext:rs,toml`, `size:>10mb` / `size:<1kb` /
/// `size:4kb..2mb`, `after:2024-01-31`, `before:2024-12-01`,
/// `attr:hidden,system,readonly,reparse,compressed,directory`. A `*.ext`
/// word becomes an extension filter, `word*` a prefix match, other wildcard
/// words a glob; remaining words join into a substring fragment.
pub fn parse_query(input: &str) -> Query {
    let mut filter = QueryFilter::default();
    let mut words: Vec<String> = Vec::new();
    let mut mode: Option<TextMatch> = None;

    for token in input.split_whitespace() {
        let lower = token.to_lowercase();

        if let Some(rest) = lower.strip_prefix("ext:") {
            let exts: Vec<String> = rest
                .split(',')
                .map(|e| e.trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty())
                .collect();
            if !exts.is_empty() {
                filter.extensions.get_or_insert_with(Vec::new).extend(exts);
            }
            continue;
        }

        if let Some(rest) = lower.strip_prefix("size:") {
            parse_size_clause(rest, &mut filter);
            continue;
        }

        if let Some(rest) = lower.strip_prefix("after:") {
            if let Some(dt) = parse_day(rest) {
                filter.modified_after = Some(dt);
            }
            continue;
        }

        if let Some(rest) = lower.strip_prefix("before:") {
            if let Some(dt) = parse_day(rest) {
                filter.modified_before = Some(dt);
            }
            continue;
        }

        if let Some(rest) = lower.strip_prefix("attr:") {
            for name in rest.split(',') {
                filter.attribute_mask |= match name {
                    "hidden" => file_attributes::HIDDEN,
                    "system" => file_attributes::SYSTEM,
                    "readonly" => file_attributes::READONLY,
                    "reparse" => file_attributes::REPARSE_POINT,
                    "compressed" => file_attributes::COMPRESSED,
                    "directory" | "dir" => file_attributes::DIRECTORY,
                    _ => 0,
                };
            }
            continue;
        }

        if lower.contains('*') || lower.contains('?') {
            // `*.ext` is just an extension filter
            if let Some(ext) = lower.strip_prefix("*.") {
                if !ext.is_empty() && !ext.contains('*') && !ext.contains('?') {
                    filter
                        .extensions
                        .get_or_insert_with(Vec::new)
                        .push(ext.to_string());
                    continue;
                }
            }

            // `word*` is a prefix match
            let stem = lower.trim_end_matches('*');
            if !stem.is_empty() && !stem.contains('*') && !stem.contains('?') && lower.ends_with('*') {
                words.push(stem.to_string());
                mode = Some(TextMatch::Prefix);
                continue;
            }

            if let Some(re) = glob_to_regex(&lower) {
                words.push(lower);
                mode = Some(TextMatch::Glob(re));
                continue;
            }
            // Unbuildable pattern: fall through as a plain word
        }

        words.push(lower);
    }

    Query {
        text: words.join(" "),
        match_mode: mode.unwrap_or(TextMatch::Substring),
        filter,
    }
}

fn parse_day(text: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn parse_size_clause(text: &str, filter: &mut QueryFilter) {
    if let Some(rest) = text.strip_prefix('>') {
        if let Some(v) = parse_size_value(rest) {
            filter.min_size = Some(v.saturating_add(1));
        }
    } else if let Some(rest) = text.strip_prefix('<') {
        if let Some(v) = parse_size_value(rest) {
            filter.max_size = Some(v.saturating_sub(1));
        }
    } else if let Some((lo, hi)) = text.split_once("..") {
        if let (Some(lo), Some(hi)) = (parse_size_value(lo), parse_size_value(hi)) {
            filter.min_size = Some(lo);
            filter.max_size = Some(hi);
        }
    } else if let Some(v) = parse_size_value(text) {
        filter.min_size = Some(v);
        filter.max_size = Some(v);
    }
}

fn parse_size_value(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, suffix) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let multiplier = match suffix.trim() {
        "" | "b" => 1u64,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1u64 << 40,
        _ => return None,
    };

    value.checked_mul(multiplier)
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ============================================================================
// Scoring
// ============================================================================

const SCORE_EXACT: u32 = 1000;
const SCORE_PREFIX: u32 = 700;
const SCORE_GLOB: u32 = 500;
const SCORE_SUBSTRING: u32 = 400;
const SCORE_FUZZY: u32 = 150;

/// Score a lowercase leaf name against the query text; `None` means no match
fn score_name(name: &str, text: &str, mode: &TextMatch) -> Option<u32> {
    if name == text {
        return Some(SCORE_EXACT);
    }

    match mode {
        TextMatch::Exact => None,
        TextMatch::Prefix => {
            if name.starts_with(text) {
                let extra = (name.len() - text.len()).min(100) as u32;
                Some(SCORE_PREFIX - extra)
            } else {
                None
            }
        }
        TextMatch::Substring => match name.find(text) {
            Some(0) => Some(SCORE_PREFIX - (name.len() - text.len()).min(100) as u32),
            Some(pos) => Some(SCORE_SUBSTRING - pos.min(100) as u32),
            None => None,
        },
        TextMatch::Fuzzy => {
            if let Some(pos) = name.find(text) {
                return Some(if pos == 0 { SCORE_PREFIX } else { SCORE_SUBSTRING } - pos.min(100) as u32);
            }
            fuzzy_gaps(name, text).map(|gaps| SCORE_FUZZY.saturating_sub(gaps.min(100)))
        }
        TextMatch::Glob(re) => {
            if re.is_match(name) {
                Some(SCORE_GLOB)
            } else {
                None
            }
        }
    }
}

/// Subsequence match: every query char appears in order. Returns the number
/// of skipped name chars between matched ones (fewer gaps rank higher).
fn fuzzy_gaps(name: &str, text: &str) -> Option<u32> {
    let mut gaps = 0u32;
    let mut started = false;
    let mut query = text.chars().filter(|c| !c.is_whitespace()).peekable();

    for c in name.chars() {
        match query.peek() {
            Some(&q) if q == c => {
                query.next();
                started = true;
            }
            Some(_) if started => gaps += 1,
            _ => {}
        }
        if query.peek().is_none() {
            break;
        }
    }

    if query.peek().is_none() {
        Some(gaps)
    } else {
        None
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct QueryEngine {
    store: Arc<IndexStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<IndexStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    /// Run a query, returning at most `max_results` hits, best first.
    /// Entries whose parent chain is broken or orphaned are excluded until a
    /// later event repairs them.
    pub fn search(&self, query: &Query, max_results: usize) -> Vec<SearchHit> {
        if max_results == 0 {
            return Vec::new();
        }

        let filter_ids = self.filter_candidates(&query.filter);
        let mut scored = self.score_candidates(query, filter_ids);

        // Rank before resolving paths; keep headroom for entries dropped by
        // the attribute mask or broken parent chains
        scored.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(max_results.saturating_mul(8).saturating_add(64));

        let mask = query.filter.attribute_mask;
        let mut hits: Vec<(SearchHit, usize)> = Vec::new();

        for (record, score) in scored {
            let entry = match self.store.get_record(record) {
                Some(e) => e,
                None => continue,
            };

            if mask != 0 && entry.attributes & mask != mask {
                continue;
            }

            let path = match self.store.resolve_path_string(entry.id) {
                Ok(p) => p,
                Err(_) => continue, // excluded until the chain is repaired
            };

            let depth = path.matches('/').count();
            hits.push((SearchHit { entry, path, score }, depth));
        }

        hits.sort_by(|(a, da), (b, db)| {
            b.score
                .cmp(&a.score)
                .then_with(|| da.cmp(db))
                .then_with(|| a.entry.name.to_lowercase().cmp(&b.entry.name.to_lowercase()))
        });
        hits.truncate(max_results);

        hits.into_iter().map(|(hit, _)| hit).collect()
    }

    /// Intersect the candidate sets of every active metadata filter
    fn filter_candidates(&self, filter: &QueryFilter) -> Option<HashSet<u64>> {
        if !filter.uses_secondary_indexes() {
            return None;
        }
        self.store.filter_ids(filter)
    }

    fn score_candidates(
        &self,
        query: &Query,
        filter_ids: Option<HashSet<u64>>,
    ) -> Vec<(u64, u32)> {
        let text = query.text.as_str();
        let has_text = !text.is_empty() || matches!(query.match_mode, TextMatch::Glob(_));
        let mut scored = Vec::new();

        match (filter_ids, has_text) {
            (Some(ids), false) => {
                // Pure filter query: everything qualifies equally
                scored.extend(ids.into_iter().map(|id| (id, 0)));
            }
            (Some(ids), true) => {
                // Filters already narrowed the space; score those names only
                for id in ids {
                    if let Some(entry) = self.store.get_record(id) {
                        if let Some(score) =
                            score_name(&entry.name.to_lowercase(), text, &query.match_mode)
                        {
                            scored.push((id, score));
                        }
                    }
                }
            }
            (None, true) => match &query.match_mode {
                TextMatch::Exact => {
                    scored.extend(
                        self.store
                            .ids_with_name(text)
                            .into_iter()
                            .map(|id| (id, SCORE_EXACT)),
                    );
                }
                TextMatch::Prefix => {
                    for id in self.store.ids_with_name_prefix(text) {
                        if let Some(entry) = self.store.get_record(id) {
                            if let Some(score) =
                                score_name(&entry.name.to_lowercase(), text, &query.match_mode)
                            {
                                scored.push((id, score));
                            }
                        }
                    }
                }
                mode => {
                    self.store.for_each_name(|name, ids| {
                        if let Some(score) = score_name(name, text, mode) {
                            scored.extend(ids.iter().map(|&id| (id, score)));
                        }
                    });
                }
            },
            (None, false) => {
                // Empty query: list everything (bounded later)
                self.store.for_each_name(|_, ids| {
                    scored.extend(ids.iter().map(|&id| (id, 0)));
                });
            }
        }

        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::entry::FileRef;

    fn entry(record: u64, parent: u64, name: &str, is_dir: bool, size: u64) -> IndexEntry {
        IndexEntry {
            id: FileRef::from_parts(record, 1),
            parent: FileRef::from_parts(parent, if parent == 5 { 5 } else { 1 }),
            name: name.to_string(),
            is_directory: is_dir,
            size,
            allocated_size: size,
            created: 0,
            modified: 0,
            accessed: 0,
            attributes: 0,
            hard_link_count: 1,
            content_tag: None,
        }
    }

    fn seeded_store() -> Arc<IndexStore> {
        let store = Arc::new(IndexStore::new("test"));
        store.upsert(IndexEntry {
            id: FileRef::from_parts(5, 5),
            parent: FileRef::from_parts(5, 5),
            name: ".".into(),
            is_directory: true,
            size: 0,
            allocated_size: 0,
            created: 0,
            modified: 0,
            accessed: 0,
            attributes: 0,
            hard_link_count: 1,
            content_tag: None,
        });
        store.upsert(entry(16, 5, "docs", true, 0));
        store.upsert(entry(17, 16, "readme.txt", false, 100));
        store.upsert(entry(18, 16, "notes.txt", false, 5_000));
        store.upsert(entry(19, 5, "readme.md", false, 2_000_000));
        store.upsert(entry(20, 5, "read-only-manifest.json", false, 10));
        store
    }

    #[test]
    fn exact_beats_prefix_beats_substring() {
        let engine = QueryEngine::new(seeded_store());
        let hits = engine.search(&Query::substring("readme.txt"), 10);

        assert_eq!(hits[0].entry.name, "readme.txt");
        assert_eq!(hits[0].score, SCORE_EXACT);

        let hits = engine.search(&Query::substring("read"), 10);
        let names: Vec<&str> = hits.iter().map(|h| h.entry.name.as_str()).collect();
        // All are prefix matches; shorter names score higher
        assert_eq!(names[0], "readme.md");
        assert!(names.contains(&"readme.txt"));
        assert!(names.contains(&"read-only-manifest.json"));
    }

    #[test]
    fn filters_restrict_before_ranking() {
        let engine = QueryEngine::new(seeded_store());

        let mut query = Query::substring("readme");
        query.filter.extensions = Some(vec!["md".into()]);
        let hits = engine.search(&query, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.name, "readme.md");

        let mut query = Query::substring("");
        query.filter.min_size = Some(1_000);
        query.filter.max_size = Some(10_000);
        let hits = engine.search(&query, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.name, "notes.txt");
    }

    #[test]
    fn paths_and_tie_breaks() {
        let engine = QueryEngine::new(seeded_store());
        let query = parse_query("*.txt");
        let hits = engine.search(&query, 10);

        assert_eq!(hits.len(), 2);
        let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
        assert!(paths.contains(&"docs/readme.txt"));
        assert!(paths.contains(&"docs/notes.txt"));
        // Equal score and depth: lexicographic name
        assert_eq!(hits[0].entry.name, "notes.txt");
    }

    #[test]
    fn broken_chain_entries_are_excluded() {
        let store = seeded_store();
        store.upsert(entry(30, 99, "dangling.txt", false, 1)); // parent never indexed
        let engine = QueryEngine::new(store);

        let hits = engine.search(&Query::substring("dangling"), 10);
        assert!(hits.is_empty());
    }

    #[test]
    fn fuzzy_subsequence_matches() {
        let engine = QueryEngine::new(seeded_store());
        let mut query = Query::substring("rdme");
        query.match_mode = TextMatch::Fuzzy;
        let hits = engine.search(&query, 10);
        let names: Vec<&str> = hits.iter().map(|h| h.entry.name.as_str()).collect();
        assert!(names.contains(&"readme.txt"));
        assert!(names.contains(&"readme.md"));
        assert!(!names.contains(&"docs"));
    }

    #[test]
    fn parse_query_clauses() {
        let q = parse_query("ext:rs,toml size:>10mb report");
        assert_eq!(q.filter.extensions.as_ref().unwrap(), &vec!["rs".to_string(), "toml".to_string()]);
        assert_eq!(q.filter.min_size, Some(10 * 1024 * 1024 + 1));
        assert_eq!(q.text, "report");

        let q = parse_query("*.txt");
        assert_eq!(q.filter.extensions.as_ref().unwrap(), &vec!["txt".to_string()]);
        assert!(q.text.is_empty());

        let q = parse_query("inv*");
        assert!(matches!(q.match_mode, TextMatch::Prefix));
        assert_eq!(q.text, "inv");

        let q = parse_query("re?ort.*");
        assert!(matches!(q.match_mode, TextMatch::Glob(_)));

        let q = parse_query("size:4kb..2mb");
        assert_eq!(q.filter.min_size, Some(4 * 1024));
        assert_eq!(q.filter.max_size, Some(2 * 1024 * 1024));

        let q = parse_query("after:2024-01-31 attr:hidden,system");
        assert!(q.filter.modified_after.is_some());
        assert_eq!(
            q.filter.attribute_mask,
            file_attributes::HIDDEN | file_attributes::SYSTEM
        );
    }

    #[test]
    fn attribute_mask_filters_entries() {
        let store = seeded_store();
        let mut hidden = entry(31, 5, "secret.txt", false, 1);
        hidden.attributes = file_attributes::HIDDEN;
        store.upsert(hidden);
        let engine = QueryEngine::new(store);

        let mut query = Query::substring("secret");
        query.filter.attribute_mask = file_attributes::HIDDEN;
        assert_eq!(engine.search(&query, 10).len(), 1);

        let mut query = Query::substring("readme");
        query.filter.attribute_mask = file_attributes::HIDDEN;
        assert!(engine.search(&query, 10).is_empty());
    }
}
