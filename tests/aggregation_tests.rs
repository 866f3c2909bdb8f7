mod common;

use common::{page_body, row};
use fofa_view_rs::aggregator::AggregationState;
use fofa_view_rs::config::FofaConfig;
use fofa_view_rs::decoder::{decode_page, parse_page};
use fofa_view_rs::types::{AdditionalField, ExportRecord, Record};

fn config(page_size: u64) -> FofaConfig {
    FofaConfig {
        page_size,
        ..Default::default()
    }
}

#[test]
fn merging_the_same_page_twice_does_not_double_count() {
    let page = parse_page(&page_body(
        3,
        None,
        vec![
            row("a.com", "A", "1.1.1.1", 443, "https"),
            row("b.com:8080", "B", "2.2.2.2", 8080, "http"),
            row("3.3.3.3", "", "3.3.3.3", 22, "ssh"),
        ],
    ))
    .unwrap();

    let mut once: AggregationState<Record> = AggregationState::new();
    once.apply_page(&page, &config(10));

    let mut twice: AggregationState<Record> = AggregationState::new();
    twice.apply_page(&page, &config(10));
    twice.apply_page(&page, &config(10));

    assert_eq!(once.len(), 3);
    assert_eq!(twice.len(), once.len());
    assert_eq!(twice.count(), 3);
}

#[test]
fn default_port_suffix_merges_into_plain_host() {
    let page = parse_page(&page_body(
        2,
        None,
        vec![
            row("1.2.3.4:443", "", "1.2.3.4", 443, "https"),
            row("1.2.3.4", "", "1.2.3.4", 443, "https"),
        ],
    ))
    .unwrap();
    let mut st: AggregationState<Record> = AggregationState::new();
    st.apply_page(&page, &config(10));

    assert_eq!(st.len(), 1);
    assert_eq!(st.records()[0].service.host, "1.2.3.4");
}

#[test]
fn titled_record_survives_untitled_duplicate() {
    let page = parse_page(&page_body(
        2,
        None,
        vec![
            row("x.com", "X", "4.4.4.4", 80, "http"),
            row("x.com", "", "4.4.4.4", 80, "http"),
        ],
    ))
    .unwrap();
    let mut st: AggregationState<Record> = AggregationState::new();
    let stats = st.apply_page(&page, &config(10));

    assert_eq!(st.len(), 1);
    assert_eq!(st.records()[0].service.title, "X");
    assert_eq!(st.records()[0].sequence, 1);
    assert_eq!((stats.appended, stats.discarded), (1, 1));
}

#[test]
fn sequence_numbers_survive_discard_and_transfer_on_replace() {
    let cfg = config(10);
    let mut st: AggregationState<Record> = AggregationState::new();
    let first = parse_page(&page_body(
        3,
        Some("n1"),
        vec![
            row("8.8.8.8", "", "8.8.8.8", 22, "ssh"),
            row("b.com:443", "", "5.5.5.5", 443, "https"),
            row("c.com", "C", "6.6.6.6", 80, "http"),
        ],
    ))
    .unwrap();
    st.apply_page(&first, &cfg);

    let second = parse_page(&page_body(
        3,
        None,
        vec![
            // discarded: existing entry already has a title
            row("c.com", "", "6.6.6.6", 80, "http"),
            // replaces b.com:443 and inherits its number
            row("b.com", "B", "5.5.5.5", 443, "https"),
            row("d.com", "", "7.7.7.7", 443, "https"),
        ],
    ))
    .unwrap();
    st.apply_page(&second, &cfg);

    let seqs: Vec<(u64, &str)> = st
        .records()
        .iter()
        .map(|r| (r.sequence, r.service.host.as_str()))
        .collect();
    assert_eq!(
        seqs,
        vec![(1, "8.8.8.8"), (2, "b.com"), (3, "c.com"), (4, "d.com")]
    );
    assert_eq!(st.records()[2].service.title, "C");
    assert_eq!(st.count(), 4);
}

#[test]
fn unsuffixed_http_row_on_odd_port_is_dropped() {
    let page = parse_page(&page_body(
        1,
        None,
        vec![row("example.com", "", "1.1.1.1", 8080, "http")],
    ))
    .unwrap();
    let decoded: Vec<Record> = decode_page(&page, &[]);
    assert!(decoded.is_empty());
}

#[test]
fn suffixed_blank_title_then_plain_titled_row_collapse_to_one() {
    let page = parse_page(&page_body(
        2,
        None,
        vec![
            row("9.9.9.9:80", "", "9.9.9.9", 80, "http"),
            row("9.9.9.9", "Login", "9.9.9.9", 80, "http"),
        ],
    ))
    .unwrap();
    let mut st: AggregationState<Record> = AggregationState::new();
    st.apply_page(&page, &config(10));

    assert_eq!(st.len(), 1);
    let r = &st.records()[0];
    assert_eq!(r.service.host, "9.9.9.9");
    assert_eq!(r.service.title, "Login");
    assert_eq!(r.sequence, 1);
}

#[test]
fn identical_suffixed_hosts_keep_one_entry_and_take_the_title() {
    let cfg = config(10);
    let mut st: AggregationState<Record> = AggregationState::new();
    let first = parse_page(&page_body(
        2,
        Some("n1"),
        vec![row("x:443", "", "1.2.3.4", 443, "https")],
    ))
    .unwrap();
    st.apply_page(&first, &cfg);

    let second = parse_page(&page_body(
        2,
        None,
        vec![row("x:443", "T", "1.2.3.4", 443, "https")],
    ))
    .unwrap();
    let stats = st.apply_page(&second, &cfg);

    assert_eq!(stats.replaced, 1);
    assert_eq!(st.len(), 1);
    let r = &st.records()[0];
    assert_eq!((r.sequence, r.service.host.as_str(), r.service.title.as_str()), (1, "x:443", "T"));
}

#[test]
fn empty_page_leaves_pagination_untouched() {
    let mut st: AggregationState<Record> = AggregationState::new();
    let first = parse_page(&page_body(
        50,
        Some("n1"),
        vec![row("a.com", "", "1.1.1.1", 443, "https")],
    ))
    .unwrap();
    st.apply_page(&first, &config(10));
    assert_eq!(st.total, 50);
    assert!(st.has_more_data);

    let empty = parse_page(r#"{"error":false,"size":0,"results":[]}"#).unwrap();
    let decoded: Vec<Record> = decode_page(&empty, &[]);
    assert!(decoded.is_empty());
    let stats = st.apply_page(&empty, &config(10));

    assert_eq!(stats.rows, 0);
    assert_eq!(st.total, 50);
    assert!(st.has_more_data);
    assert_eq!(st.next.as_deref(), Some("n1"));
    assert_eq!(st.len(), 1);
}

#[test]
fn small_total_stops_pagination() {
    let mut st: AggregationState<Record> = AggregationState::new();
    let page = parse_page(&page_body(
        1,
        Some("n1"),
        vec![row("a.com", "", "1.1.1.1", 443, "https")],
    ))
    .unwrap();
    st.apply_page(&page, &config(100));
    assert_eq!(st.total, 1);
    assert!(!st.has_more_data);
}

#[test]
fn record_cap_stops_pagination() {
    let cfg = FofaConfig {
        page_size: 2,
        max_records: 2,
        ..Default::default()
    };
    let mut st: AggregationState<Record> = AggregationState::new();
    let page = parse_page(&page_body(
        100,
        Some("n1"),
        vec![
            row("a.com", "", "1.1.1.1", 443, "https"),
            row("b.com", "", "2.2.2.2", 443, "https"),
        ],
    ))
    .unwrap();
    st.apply_page(&page, &cfg);
    assert!(!st.has_more_data);
}

#[test]
fn export_mode_decodes_additional_fields_and_dedups() {
    let mut r1 = row("a.com:443", "", "1.1.1.1", 443, "https");
    r1.as_array_mut().unwrap().extend([serde_json::json!("Linux"), serde_json::json!("nginx")]);
    let mut r2 = row("a.com", "Home", "1.1.1.1", 443, "https");
    r2.as_array_mut().unwrap().extend([serde_json::json!("Linux"), serde_json::Value::Null]);

    let cfg = FofaConfig {
        additional_fields: vec![AdditionalField::Os, AdditionalField::Product],
        ..config(10)
    };
    let page = parse_page(&page_body(2, None, vec![r1, r2])).unwrap();
    let mut st: AggregationState<ExportRecord> = AggregationState::new();
    st.apply_page(&page, &cfg);

    assert_eq!(st.len(), 1);
    let s = &st.records()[0].service;
    assert_eq!(s.host, "a.com");
    assert_eq!(s.extras.os, "Linux");
    assert_eq!(s.extras.product, "");
    assert_eq!(st.urls().len(), 2);
}
