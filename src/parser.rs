//! Turns the CSV rule table into a validated [`ConfigModel`].
//!
//! ```text
//! type,page_size,start_offset,end_offset
//! brk,2MB,0,1GB
//! mmap,1GB,4GB,8GB
//! ```
//!
//! Parsing is pure: nothing is reserved here and alignment to the page size is
//! left to [`crate::reserve`], which is the one that knows what the OS can back.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::config::{AllocKind, ConfigModel, PageSize, PlacementRule};
use crate::error::{ConfigError, ConfigResult};
use crate::utils::size_from_str;

/// Deserialized CSV row, before any validation.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    region_type: String,
    page_size: String,
    start_offset: String,
    end_offset: String,
}

/// Parses configuration `text`.
pub fn parse(text: &str) -> ConfigResult<ConfigModel> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(text.as_bytes());

    // Column names are matched case-insensitively; rows are decoded against
    // the lowercased names.
    let headers: csv::StringRecord = reader
        .headers()
        .map_err(|source| ConfigError::MalformedRow { line: 1, source })?
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect();

    let expected: Vec<&str> = ConfigModel::HEADER.split(',').collect();
    if headers.iter().ne(expected.iter().copied()) {
        return Err(ConfigError::MissingHeader);
    }

    let mut rules = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| ConfigError::MalformedRow {
            line: source.position().map_or(0, |p| p.line() as usize),
            source,
        })?;
        let line = record.position().map_or(0, |p| p.line() as usize);

        let row: CsvRecord = record
            .deserialize(Some(&headers))
            .map_err(|source| ConfigError::MalformedRow { line, source })?;

        rules.push(rule_from_record(row, line)?);
    }

    validate_disjoint(&rules)?;

    Ok(ConfigModel::from_rules(rules))
}

/// Reads and parses the configuration file at `path`.
pub fn parse_file(path: impl AsRef<Path>) -> ConfigResult<ConfigModel> {
    let text = fs::read_to_string(path)?;
    parse(&text)
}

fn rule_from_record(row: CsvRecord, line: usize) -> ConfigResult<PlacementRule> {
    let kind = AllocKind::from_token(&row.region_type).ok_or_else(|| ConfigError::UnknownKind {
        line,
        token: row.region_type.clone(),
    })?;

    let page_size =
        PageSize::from_token(&row.page_size).ok_or_else(|| ConfigError::UnknownPageSize {
            line,
            token: row.page_size.clone(),
        })?;

    let offset = |token: &str| {
        size_from_str(token).ok_or_else(|| ConfigError::InvalidOffset {
            line,
            token: token.to_string(),
        })
    };
    let start = offset(&row.start_offset)?;
    let end = offset(&row.end_offset)?;

    if end <= start {
        return Err(ConfigError::EmptyOrInvertedRange { line, start, end });
    }

    Ok(PlacementRule {
        kind,
        page_size,
        range: start..end,
        line,
    })
}

/// Rules of the same kind must not share a single byte of their ranges.
fn validate_disjoint(rules: &[PlacementRule]) -> ConfigResult<()> {
    for kind in [AllocKind::HeapGrowth, AllocKind::AnonymousMapping] {
        let mut sorted: Vec<&PlacementRule> = rules.iter().filter(|r| r.kind == kind).collect();
        sorted.sort_by_key(|r| r.range.start);

        for pair in sorted.windows(2) {
            if pair[0].overlaps(pair[1]) {
                return Err(ConfigError::OverlappingRanges {
                    kind,
                    first: pair[0].line.min(pair[1].line),
                    second: pair[0].line.max(pair[1].line),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HEADER: &str = "type,page_size,start_offset,end_offset\n";

    #[test]
    fn header_case_is_ignored() {
        let model = parse("TYPE,Page_Size,START_OFFSET,end_offset\nmmap,2MB,0,4MB\n").unwrap();
        assert_eq!(model.rules().len(), 1);
        assert_eq!(model.rules()[0].page_size, PageSize::Huge2M);
        assert_eq!(model.rules()[0].range, 0..4 << 20);
    }

    #[test]
    fn parse_mixed_rules() {
        let model = parse(&format!(
            "{HEADER}brk,2MB,0,1GB\nmmap,1GB,4GB,8GB\nmmap,64KB,0,64MB\n"
        ))
        .unwrap();

        assert_eq!(model.rules().len(), 3);
        assert_eq!(
            model.rules()[0],
            PlacementRule {
                kind: AllocKind::HeapGrowth,
                page_size: PageSize::Huge2M,
                range: 0..(1 << 30),
                line: 2,
            }
        );

        let anon = model.rules_of(AllocKind::AnonymousMapping);
        assert_eq!(anon[0].range, 0..(64 << 20));
        assert_eq!(anon[1].page_size, PageSize::Huge1G);
    }

    #[test]
    fn tolerate_spaces_comments_and_blank_lines() {
        let model = parse(&format!(
            "{HEADER}# heap\n brk , 2MB , 0 , 4MB \n\nmmap,4KB,0,8KB\n"
        ))
        .unwrap();

        assert_eq!(model.rules().len(), 2);
        assert_eq!(model.rules()[0].range, 0..(4 << 20));
    }

    #[test]
    fn header_only_is_an_empty_model() {
        assert!(parse(HEADER).unwrap().is_empty());
    }

    #[test]
    fn reject_unknown_kind() {
        let err = parse(&format!("{HEADER}file,2MB,0,4MB\n")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKind { line: 2, ref token } if token == "file"));
    }

    #[test]
    fn reject_unknown_page_size() {
        let err = parse(&format!("{HEADER}brk,2MB,0,4MB\nmmap,3MB,0,6MB\n")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPageSize { line: 3, .. }));
    }

    #[test]
    fn reject_bad_offsets() {
        let err = parse(&format!("{HEADER}brk,2MB,-2MB,4MB\n")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOffset { line: 2, .. }));

        let err = parse(&format!("{HEADER}brk,2MB,4MB,4MB\n")).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyOrInvertedRange { line: 2, .. }));

        let err = parse(&format!("{HEADER}brk,2MB,8MB,4MB\n")).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyOrInvertedRange { .. }));
    }

    #[test]
    fn reject_overlap_naming_both_lines() {
        let err = parse(&format!(
            "{HEADER}mmap,2MB,4MB,8MB\nbrk,2MB,0,8MB\nmmap,4KB,0,6MB\n"
        ))
        .unwrap_err();

        match err {
            ConfigError::OverlappingRanges { kind, first, second } => {
                assert_eq!(kind, AllocKind::AnonymousMapping);
                assert_eq!((first, second), (2, 4));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let model = parse(&format!("{HEADER}brk,2MB,0,4MB\nbrk,4KB,4MB,8MB\n")).unwrap();
        assert_eq!(model.rules().len(), 2);
    }

    #[test]
    fn reject_missing_header() {
        let err = parse("brk,2MB,0,4MB\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingHeader));

        let err = parse("").unwrap_err();
        assert!(matches!(err, ConfigError::MissingHeader));
    }

    #[test]
    fn reject_short_rows() {
        let err = parse(&format!("{HEADER}brk,2MB,0\n")).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedRow { line: 2, .. }));
    }

    #[test]
    fn serialized_model_parses_back() {
        let text = format!("{HEADER}brk,2MB,0,1GB\nmmap,64KB,3MB,7MB\nmmap,4KB,1GB,1025MB\n");
        let model = parse(&text).unwrap();
        let reparsed = parse(&model.to_csv()).unwrap();

        assert_eq!(model, reparsed);
    }
}
