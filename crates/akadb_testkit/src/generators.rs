//! Property-based test generators using proptest.
//!
//! Provides strategies for generating records, patches and filters that
//! satisfy the record validation rules.

use akadb_core::{IsolationLevel, Record, RecordFilter, RecordPatch};
use proptest::prelude::*;

/// Strategy for title ids like `tt0004821`.
pub fn title_id_strategy() -> impl Strategy<Value = String> {
    (0u32..10_000).prop_map(|n| format!("tt{n:07}"))
}

/// Strategy for region codes from a small pool, so groups repeat.
pub fn region_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["US", "PH", "JP", "FR", "DE", "XWW"]).prop_map(String::from)
}

/// Strategy for title types.
pub fn types_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["movie", "short", "tvSeries", "imdbDisplay", "original"])
        .prop_map(String::from)
}

/// Strategy for non-blank title text.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9 ]{0,23}").expect("Invalid regex")
}

/// Strategy for valid records.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    (
        title_id_strategy(),
        1i32..5,
        title_strategy(),
        region_strategy(),
        types_strategy(),
        prop::option::of(prop::string::string_regex("[a-z ]{1,12}").expect("Invalid regex")),
        any::<bool>(),
    )
        .prop_map(|(id, ordering, title, region, types, attributes, original)| {
            let record = Record::new(id, ordering, title, region, "en", types).original(original);
            match attributes {
                Some(attributes) => record.with_attributes(attributes),
                None => record,
            }
        })
}

/// Strategy for record sets with unique keys.
pub fn unique_records_strategy(max: usize) -> impl Strategy<Value = Vec<Record>> {
    prop::collection::vec(record_strategy(), 0..max).prop_map(|records| {
        let mut seen = std::collections::HashSet::new();
        records
            .into_iter()
            .filter(|record| seen.insert(record.key()))
            .collect()
    })
}

/// Strategy for non-empty patches that pass validation.
pub fn patch_strategy() -> impl Strategy<Value = RecordPatch> {
    (
        prop::option::of(title_strategy()),
        prop::option::of(region_strategy()),
        prop::option::of(any::<bool>()),
    )
        .prop_map(|(title, region, original)| RecordPatch {
            title,
            region,
            is_original_title: original,
            ..RecordPatch::default()
        })
        .prop_filter("patch must change something", |patch| !patch.is_empty())
}

/// Strategy for filters over the pools above.
pub fn filter_strategy() -> impl Strategy<Value = RecordFilter> {
    (
        prop::option::of(region_strategy()),
        prop::option::of(prop::string::string_regex("[a-z]{1,2}").expect("Invalid regex")),
    )
        .prop_map(|(region, title)| RecordFilter {
            title_id: None,
            title,
            region,
        })
}

/// Strategy over every isolation level.
pub fn isolation_strategy() -> impl Strategy<Value = IsolationLevel> {
    prop::sample::select(IsolationLevel::ALL.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_records_are_valid(record in record_strategy()) {
            prop_assert!(record.validate().is_ok());
        }

        #[test]
        fn generated_patches_are_valid(patch in patch_strategy()) {
            prop_assert!(patch.validate().is_ok());
        }

        #[test]
        fn unique_records_have_unique_keys(records in unique_records_strategy(20)) {
            let keys: std::collections::HashSet<_> = records.iter().map(Record::key).collect();
            prop_assert_eq!(keys.len(), records.len());
        }
    }
}
