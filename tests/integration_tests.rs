use chrono::{NaiveDate, NaiveDateTime};
use monthly_kpi_reconciler::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn stamp(y: i32, m: u32, d: u32) -> NaiveDateTime {
    date(y, m, d).and_hms_opt(7, 30, 0).unwrap()
}

fn month(y: i32, m: u32) -> ReferenceMonth {
    ReferenceMonth::new(y, m).unwrap()
}

fn revenue_rows() -> Vec<RawRecord> {
    vec![
        RawRecord::new("F001", date(2024, 9, 10), dec!(2000.00), "positivador").with_name("Ana Souza"),
        RawRecord::new("F001", date(2024, 10, 15), dec!(1500.00), "coe"),
        RawRecord::new("F001", date(2024, 11, 4), dec!(6000.00), "positivador").with_name("Ana Souza"),
        RawRecord::new("F001", date(2024, 11, 20), dec!(4000.00), "positivador"),
        RawRecord::new("F002", date(2024, 11, 2), dec!(800.00), "positivador").with_name("Bruno Lima"),
    ]
}

fn payroll_rows() -> Vec<RawRecord> {
    vec![
        RawRecord::new("F001", date(2024, 10, 5), dec!(3000.00), "salario_base"),
        RawRecord::new("F001", date(2024, 10, 6), dec!(99.00), "vale_transporte"),
        RawRecord::new("F001", date(2024, 11, 5), dec!(3000.00), "salario_base"),
        RawRecord::new("F001", date(2024, 11, 5), dec!(500.00), "bonus"),
        RawRecord::new("F002", date(2024, 11, 5), dec!(2000.00), "salario_base"),
    ]
}

struct Fixture {
    _dir: tempfile::TempDir,
    source: PathBuf,
    destination: PathBuf,
}

impl Fixture {
    fn new(revenue: &[RawRecord], payroll: &[RawRecord]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.db");
        let destination = dir.path().join("analysis.db");

        let conn = rusqlite::Connection::open(&source).unwrap();
        SqliteExtractor::create_source_tables(&conn).unwrap();
        for record in revenue {
            SqliteExtractor::insert_record(&conn, RecordSource::Revenue, record).unwrap();
        }
        for record in payroll {
            SqliteExtractor::insert_record(&conn, RecordSource::Payroll, record).unwrap();
        }

        Self {
            _dir: dir,
            source,
            destination,
        }
    }

    fn add_revenue(&self, record: RawRecord) {
        let conn = rusqlite::Connection::open(&self.source).unwrap();
        SqliteExtractor::insert_record(&conn, RecordSource::Revenue, &record).unwrap();
    }

    /// Deletes every source row of `entity` dated in month `m`.
    fn remove_records(&self, source: RecordSource, entity: &str, m: ReferenceMonth) {
        let conn = rusqlite::Connection::open(&self.source).unwrap();
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE entity_id = ?1 AND substr(record_date, 1, 7) = ?2",
                source.table_name()
            ),
            rusqlite::params![entity, m.to_string()],
        )
        .unwrap();
    }

    /// One run as a fresh process would do it: new connections every time.
    fn run(&self, config: &PipelineConfig, loaded_at: NaiveDateTime) -> RunSummary {
        let extractor = SqliteExtractor::open(&self.source).unwrap();
        let mut session = Session::open(&self.source, &self.destination).unwrap();
        run_pipeline(config, &extractor, &mut session, loaded_at)
    }

    fn session(&self) -> Session {
        Session::open(&self.source, &self.destination).unwrap()
    }

    fn digests(&self) -> Vec<String> {
        let session = self.session();
        DestinationTable::ALL
            .iter()
            .map(|table| table_digest(session.connection(), *table).unwrap())
            .collect()
    }

    fn rows(&self, table: DestinationTable) -> Vec<DestinationRow> {
        fetch_rows(self.session().connection(), table).unwrap()
    }
}

fn config(current: ReferenceMonth, months_back: u32) -> PipelineConfig {
    PipelineConfig::new(ReportingWindow::new(current, months_back))
}

fn rows_in(rows: &[DestinationRow], m: ReferenceMonth) -> Vec<DestinationRow> {
    rows.iter()
        .filter(|row| row.key.reference_month == m)
        .cloned()
        .collect()
}

fn commission_key(entity: &str, m: ReferenceMonth, category: &str) -> NaturalKey {
    NaturalKey::for_row(
        DestinationTable::ReceitaComissao,
        entity,
        m,
        KpiType::Commission,
        Some(category),
    )
}

#[test]
fn test_full_run_populates_every_table() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    let summary = fixture.run(&config(month(2024, 11), 2), stamp(2024, 11, 25));

    assert!(summary.is_success(), "{}", summary);

    let receita = fixture.rows(DestinationTable::ReceitaComissao);
    // revenue + commission rows: F001 Sep, Oct, Nov and F002 Nov, one category each
    assert_eq!(receita.len(), 8);

    let folha = fixture.rows(DestinationTable::FolhaPagamento);
    assert_eq!(folha.len(), 3);
    let f001_oct = folha
        .iter()
        .find(|row| row.key.entity_id == "F001" && row.key.reference_month == month(2024, 10))
        .unwrap();
    assert_eq!(f001_oct.amount, dec!(3000.00));
    assert!(!f001_oct.breakdown.contains_key("vale_transporte"));
    assert_eq!(f001_oct.provenance, Provenance::Historical);

    let financeiro = fixture.rows(DestinationTable::FinanceiroMensal);
    let f001_nov = financeiro
        .iter()
        .find(|row| row.key.entity_id == "F001" && row.key.reference_month == month(2024, 11))
        .unwrap();
    assert_eq!(f001_nov.amount, dec!(4500.00));
    assert_eq!(f001_nov.breakdown["comissao"], dec!(1000.00));
    assert_eq!(f001_nov.breakdown["folha"], dec!(3500.00));
    assert_eq!(f001_nov.entity_name.as_deref(), Some("Ana Souza"));
}

#[test]
fn test_idempotent_reruns() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    let config = config(month(2024, 11), 2);

    fixture.run(&config, stamp(2024, 11, 25));
    let first = fixture.digests();
    let counts: Vec<usize> = DestinationTable::ALL
        .iter()
        .map(|table| fixture.rows(*table).len())
        .collect();

    let summary = fixture.run(&config, stamp(2024, 11, 26));
    assert_eq!(fixture.digests(), first);

    let recounts: Vec<usize> = DestinationTable::ALL
        .iter()
        .map(|table| fixture.rows(*table).len())
        .collect();
    assert_eq!(counts, recounts);

    for outcome in &summary.outcomes {
        let report = outcome.report.as_ref().unwrap();
        assert_eq!(report.inserted, 0, "{}", report);
        assert_eq!(report.removed, 0, "{}", report);
    }
}

#[test]
fn test_widening_the_window_only_adds_earlier_months() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());

    fixture.run(&config(month(2024, 11), 1), stamp(2024, 11, 25));
    let narrow = fixture.rows(DestinationTable::ReceitaComissao);
    assert!(rows_in(&narrow, month(2024, 9)).is_empty());

    fixture.run(&config(month(2024, 11), 2), stamp(2024, 11, 26));
    let wide = fixture.rows(DestinationTable::ReceitaComissao);

    assert_eq!(rows_in(&wide, month(2024, 9)).len(), 2);
    // Closed month: untouched, timestamps included
    assert_eq!(rows_in(&wide, month(2024, 10)), rows_in(&narrow, month(2024, 10)));

    // Open month: recomputed to the same values
    let before = rows_in(&narrow, month(2024, 11));
    let after = rows_in(&wide, month(2024, 11));
    assert_eq!(before.len(), after.len());
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.key, new.key);
        assert_eq!(old.amount, new.amount);
        assert_eq!(new.updated_at, stamp(2024, 11, 26));
    }
}

#[test]
fn test_months_without_raw_rows_get_no_rows() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    fixture.run(&config(month(2024, 11), 2), stamp(2024, 11, 25));

    // F001 has no payroll in September and F002 nothing before November
    let folha = fixture.rows(DestinationTable::FolhaPagamento);
    assert!(rows_in(&folha, month(2024, 9)).is_empty());

    for table in DestinationTable::ALL {
        assert!(fixture
            .rows(table)
            .iter()
            .all(|row| row.key.entity_id != "F002" || row.key.reference_month == month(2024, 11)));
        assert!(fixture.rows(table).iter().all(|row| !row.amount.is_zero()));
    }

    // Financial row for a month with only revenue carries only the commission part
    let financeiro = fixture.rows(DestinationTable::FinanceiroMensal);
    let sep = rows_in(&financeiro, month(2024, 9));
    assert_eq!(sep.len(), 1);
    assert_eq!(sep[0].breakdown.keys().collect::<Vec<_>>(), vec!["comissao"]);
}

#[test]
fn test_historical_rows_survive_late_source_changes() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    let config = config(month(2024, 11), 2);
    fixture.run(&config, stamp(2024, 11, 25));

    let key = commission_key("F001", month(2024, 10), "coe");
    let stored = fetch_row(fixture.session().connection(), DestinationTable::ReceitaComissao, &key)
        .unwrap()
        .unwrap();
    assert_eq!(stored.amount, dec!(150.00));

    fixture.add_revenue(RawRecord::new("F001", date(2024, 10, 30), dec!(500.00), "coe"));

    let summary = fixture.run(&config, stamp(2024, 11, 26));
    assert!(summary.report_for(KpiType::Commission).unwrap().skipped > 0);
    let unchanged = fetch_row(fixture.session().connection(), DestinationTable::ReceitaComissao, &key)
        .unwrap()
        .unwrap();
    assert_eq!(unchanged, stored);

    let mut forced = config.clone();
    forced.force_historical = true;
    fixture.run(&forced, stamp(2024, 11, 27));
    let rewritten = fetch_row(fixture.session().connection(), DestinationTable::ReceitaComissao, &key)
        .unwrap()
        .unwrap();
    assert_eq!(rewritten.amount, dec!(200.00));
    assert_eq!(rewritten.provenance, Provenance::Historical);
    assert_eq!(rewritten.created_at, stored.created_at);
}

/// Checks every stored financial total against the stored commission and
/// payroll rows. Returns the financial totals.
fn assert_financial_identity(fixture: &Fixture) -> BTreeMap<(String, String), Decimal> {
    let session = fixture.session();
    let conn = session.connection();
    let commission =
        store::monthly_totals(conn, DestinationTable::ReceitaComissao, KpiType::Commission).unwrap();
    let payroll =
        store::monthly_totals(conn, DestinationTable::FolhaPagamento, KpiType::Payroll).unwrap();
    let financial =
        store::monthly_totals(conn, DestinationTable::FinanceiroMensal, KpiType::Financial).unwrap();

    for (key, total) in &financial {
        let expected = commission.get(key).copied().unwrap_or(Decimal::ZERO)
            + payroll.get(key).copied().unwrap_or(Decimal::ZERO);
        assert_eq!(*total, expected, "{:?}", key);
    }
    for key in commission.keys().chain(payroll.keys()) {
        assert!(financial.contains_key(key), "no financial row for {:?}", key);
    }
    financial
}

fn total_of(totals: &BTreeMap<(String, String), Decimal>, entity: &str, m: ReferenceMonth) -> Option<Decimal> {
    totals.get(&(entity.to_string(), m.to_string())).copied()
}

#[test]
fn test_financial_total_matches_commission_plus_payroll() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    fixture.run(&config(month(2024, 11), 2), stamp(2024, 11, 25));

    let financial = assert_financial_identity(&fixture);
    assert_eq!(financial.len(), 4);
}

#[test]
fn test_open_month_rows_go_when_their_source_rows_go() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    let config = config(month(2024, 11), 2);
    fixture.run(&config, stamp(2024, 11, 25));

    fixture.remove_records(RecordSource::Payroll, "F001", month(2024, 11));
    fixture.remove_records(RecordSource::Payroll, "F001", month(2024, 10));

    let summary = fixture.run(&config, stamp(2024, 11, 26));
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(summary.report_for(KpiType::Payroll).unwrap().removed, 1);

    let folha = fixture.rows(DestinationTable::FolhaPagamento);
    let f001: Vec<&DestinationRow> = folha.iter().filter(|row| row.key.entity_id == "F001").collect();
    // November was open and is gone; October was closed and stays
    assert_eq!(f001.len(), 1);
    assert_eq!(f001[0].key.reference_month, month(2024, 10));
    assert_eq!(f001[0].amount, dec!(3000.00));
    assert_eq!(f001[0].provenance, Provenance::Historical);
    assert!(folha.iter().any(|row| row.key.entity_id == "F002"));

    let financial = assert_financial_identity(&fixture);
    assert_eq!(total_of(&financial, "F001", month(2024, 11)), Some(dec!(1000.00)));
    assert_eq!(total_of(&financial, "F001", month(2024, 10)), Some(dec!(3150.00)));

    let financeiro = fixture.rows(DestinationTable::FinanceiroMensal);
    let f001_nov = financeiro
        .iter()
        .find(|row| row.key.entity_id == "F001" && row.key.reference_month == month(2024, 11))
        .unwrap();
    assert_eq!(f001_nov.breakdown.keys().collect::<Vec<_>>(), vec!["comissao"]);

    // Nothing left to retire on the next run
    let summary = fixture.run(&config, stamp(2024, 11, 27));
    assert!(summary.outcomes.iter().all(|o| o.report.as_ref().unwrap().removed == 0));
}

#[test]
fn test_entity_run_only_retires_that_entity() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    fixture.run(&config(month(2024, 11), 2), stamp(2024, 11, 25));

    fixture.remove_records(RecordSource::Payroll, "F001", month(2024, 11));
    fixture.remove_records(RecordSource::Payroll, "F002", month(2024, 11));

    let mut only_f002 = config(month(2024, 11), 2);
    only_f002.entity = Some("F002".to_string());
    let summary = fixture.run(&only_f002, stamp(2024, 11, 26));
    assert_eq!(summary.report_for(KpiType::Payroll).unwrap().removed, 1);

    let folha = fixture.rows(DestinationTable::FolhaPagamento);
    assert!(folha.iter().all(|row| row.key.entity_id != "F002"));
    let f001_nov = folha
        .iter()
        .find(|row| row.key.entity_id == "F001" && row.key.reference_month == month(2024, 11))
        .unwrap();
    assert_eq!(f001_nov.amount, dec!(3500.00));
    assert_eq!(f001_nov.updated_at, stamp(2024, 11, 25));
    assert_financial_identity(&fixture);

    fixture.run(&config(month(2024, 11), 2), stamp(2024, 11, 27));
    let folha = fixture.rows(DestinationTable::FolhaPagamento);
    assert_eq!(folha.len(), 1);
    assert_eq!(folha[0].key.reference_month, month(2024, 10));
    assert_financial_identity(&fixture);
}

#[test]
fn test_commission_rejected_on_rerun_is_retired() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    let config = config(month(2024, 11), 2);
    fixture.run(&config, stamp(2024, 11, 25));

    let f002_commission = commission_key("F002", month(2024, 11), "positivador");
    assert!(fetch_row(fixture.session().connection(), DestinationTable::ReceitaComissao, &f002_commission)
        .unwrap()
        .is_some());

    fixture.add_revenue(RawRecord::new("F002", date(2024, 11, 18), dec!(-1000.00), "estorno"));
    let summary = fixture.run(&config, stamp(2024, 11, 26));

    let commission = summary.report_for(KpiType::Commission).unwrap();
    assert_eq!(commission.failures.len(), 1);
    assert_eq!(commission.removed, 1);
    assert!(fetch_row(fixture.session().connection(), DestinationTable::ReceitaComissao, &f002_commission)
        .unwrap()
        .is_none());

    // Revenue may go negative and keeps both categories
    let revenue = fixture
        .rows(DestinationTable::ReceitaComissao)
        .into_iter()
        .filter(|row| row.key.entity_id == "F002" && row.key.kpi_type == KpiType::Revenue)
        .count();
    assert_eq!(revenue, 2);

    let financial = assert_financial_identity(&fixture);
    assert_eq!(total_of(&financial, "F002", month(2024, 11)), Some(dec!(2000.00)));
}

#[test]
fn test_f001_example_through_month_close() {
    let fixture = Fixture::new(
        &[
            RawRecord::new("F001", date(2024, 11, 4), dec!(6000.00), "positivador"),
            RawRecord::new("F001", date(2024, 11, 20), dec!(4000.00), "positivador"),
        ],
        &[],
    );
    let key = commission_key("F001", month(2024, 11), "positivador");
    let read = || {
        fetch_row(fixture.session().connection(), DestinationTable::ReceitaComissao, &key)
            .unwrap()
            .unwrap()
    };

    let mut november = config(month(2024, 11), 11);
    november.selection = KpiSelection::from_flags(true, false, false);

    fixture.run(&november, stamp(2024, 11, 20));
    let row = read();
    assert_eq!(row.amount, dec!(1000.00));
    assert_eq!(row.provenance, Provenance::Current);

    // Still the open month: recomputed and overwritten with the same values
    fixture.run(&november, stamp(2024, 11, 21));
    let rerun = read();
    assert_eq!(rerun.amount, dec!(1000.00));
    assert_eq!(rerun.created_at, stamp(2024, 11, 20));
    assert_eq!(rerun.updated_at, stamp(2024, 11, 21));

    // First run after the month closed flips it to historical
    let mut december = november.clone();
    december.window = ReportingWindow::new(month(2024, 12), 11);
    fixture.run(&december, stamp(2024, 12, 1));
    let closed = read();
    assert_eq!(closed.provenance, Provenance::Historical);
    assert_eq!(closed.updated_at, stamp(2024, 12, 1));

    // From then on it is frozen
    fixture.run(&december, stamp(2024, 12, 2));
    assert_eq!(read(), closed);
}

#[test]
fn test_refunds_only_where_rules_allow_them() {
    let fixture = Fixture::new(
        &[
            RawRecord::new("F003", date(2024, 11, 3), dec!(1000.00), "positivador"),
            RawRecord::new("F003", date(2024, 11, 9), dec!(-250.00), "estorno"),
        ],
        &[],
    );

    let mut only_receita = config(month(2024, 11), 0);
    only_receita.selection = KpiSelection::from_flags(true, false, false);
    let summary = fixture.run(&only_receita, stamp(2024, 11, 25));

    assert!(summary.is_success());
    let revenue = summary.report_for(KpiType::Revenue).unwrap();
    assert!(revenue.is_clean());
    assert_eq!(revenue.inserted, 2);

    let commission = summary.report_for(KpiType::Commission).unwrap();
    assert_eq!(commission.failures.len(), 1);
    assert!(commission.failures[0].reason.contains("estorno"));
    assert_eq!(commission.inserted, 0);
}

#[test]
fn test_entity_filter_leaves_other_entities_alone() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    fixture.run(&config(month(2024, 11), 2), stamp(2024, 11, 25));
    let before = fixture.rows(DestinationTable::FolhaPagamento);

    let mut only_f002 = config(month(2024, 11), 2);
    only_f002.entity = Some("F002".to_string());
    fixture.run(&only_f002, stamp(2024, 11, 26));
    let after = fixture.rows(DestinationTable::FolhaPagamento);

    for (old, new) in before.iter().zip(&after) {
        if old.key.entity_id == "F001" {
            assert_eq!(old, new);
        } else {
            assert_eq!(new.updated_at, stamp(2024, 11, 26));
        }
    }
}

fn write_csv(path: &Path, rows: &[RawRecord]) {
    let mut file = File::create(path).unwrap();
    writeln!(file, "entity_id,entity_name,date,amount,category").unwrap();
    for row in rows {
        writeln!(
            file,
            "{},{},{},{},{}",
            row.entity_id,
            row.entity_name.as_deref().unwrap_or(""),
            row.date.format("%Y-%m-%d"),
            row.amount,
            row.category
        )
        .unwrap();
    }
}

#[test]
fn test_csv_source_matches_sqlite_source() {
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    let config = config(month(2024, 11), 2);
    fixture.run(&config, stamp(2024, 11, 25));

    let csv_dir = tempfile::tempdir().unwrap();
    write_csv(&csv_dir.path().join("revenue.csv"), &revenue_rows());
    write_csv(&csv_dir.path().join("payroll.csv"), &payroll_rows());
    let csv_destination = csv_dir.path().join("analysis.db");

    let extractor = CsvExtractor::new(csv_dir.path());
    let mut session = Session::open_destination(&csv_destination).unwrap();
    let summary = run_pipeline(&config, &extractor, &mut session, stamp(2024, 11, 25));
    assert!(summary.is_success(), "{}", summary);

    let sqlite_digests = fixture.digests();
    let csv_digests: Vec<String> = DestinationTable::ALL
        .iter()
        .map(|table| table_digest(session.connection(), *table).unwrap())
        .collect();
    assert_eq!(sqlite_digests, csv_digests);
}

#[test]
fn test_rules_file_drives_commission() {
    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("rules.json");
    std::fs::write(
        &rules_path,
        r#"{
            "commission": {
                "policy": "schedule",
                "tiers": [
                    { "threshold": "0", "rate": "0.05" },
                    { "threshold": "5000", "rate": "0.08" }
                ]
            },
            "category_rates": { "coe": "0.5" },
            "withholding_rate": "0.2",
            "payroll_categories": ["salario_base"]
        }"#,
    )
    .unwrap();

    let rules = KpiRules::from_json_file(&rules_path).unwrap();
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    let mut config = config(month(2024, 11), 2);
    config.rules = rules;
    fixture.run(&config, stamp(2024, 11, 25));

    let receita = fixture.rows(DestinationTable::ReceitaComissao);
    let by_key: BTreeMap<String, &DestinationRow> =
        receita.iter().map(|row| (row.key.to_string(), row)).collect();

    // 10000 of monthly revenue reaches the 8% tier
    let nov = by_key["F001/2024-11/commission/positivador"];
    assert_eq!(nov.amount, dec!(800.00));
    assert_eq!(nov.net_amount, Some(dec!(640.00)));
    // 2000 stays on the base tier
    assert_eq!(by_key["F001/2024-09/commission/positivador"].amount, dec!(100.00));
    // Category override beats the schedule
    assert_eq!(by_key["F001/2024-10/commission/coe"].amount, dec!(750.00));

    // Bonus is no longer a payroll category under these rules
    let folha = fixture.rows(DestinationTable::FolhaPagamento);
    let f001_nov = folha
        .iter()
        .find(|row| row.key.entity_id == "F001" && row.key.reference_month == month(2024, 11))
        .unwrap();
    assert_eq!(f001_nov.amount, dec!(3000.00));
}

#[test]
fn test_revenue_target_bonus_rows() {
    let rules = KpiRules::from_json_str(
        r#"{
            "commission": { "policy": "percentage", "rate": "0.10" },
            "withholding_rate": "0.195",
            "payroll_categories": ["salario_base", "bonus"],
            "targets": {
                "entities": { "F001": { "target": "8000", "bonus_rate": "0.10" } }
            }
        }"#,
    )
    .unwrap();
    let fixture = Fixture::new(&revenue_rows(), &payroll_rows());
    let mut config = config(month(2024, 11), 2);
    config.rules = rules;
    let summary = fixture.run(&config, stamp(2024, 11, 25));
    assert!(summary.is_success(), "{}", summary);

    let session = fixture.session();
    let read = |m: ReferenceMonth| {
        fetch_row(session.connection(), DestinationTable::ReceitaComissao, &commission_key("F001", m, "bonus_meta"))
            .unwrap()
            .unwrap()
    };

    let nov = read(month(2024, 11));
    assert_eq!(nov.amount, dec!(100.00));
    assert_eq!(nov.basis, Some(dec!(1000.00)));
    assert_eq!(nov.net_amount, Some(dec!(80.50)));
    assert_eq!(nov.breakdown["target"], dec!(8000));
    assert_eq!(nov.breakdown["attainment"], dec!(1.25));
    assert_eq!(nov.breakdown["reached"], dec!(1));

    // 1500 of revenue against 8000
    let oct = read(month(2024, 10));
    assert_eq!(oct.amount, dec!(0));
    assert_eq!(oct.breakdown["reached"], dec!(0));
    assert_eq!(oct.breakdown["attainment"], dec!(0.1875));

    let f002_bonus = commission_key("F002", month(2024, 11), "bonus_meta");
    assert!(fetch_row(session.connection(), DestinationTable::ReceitaComissao, &f002_bonus)
        .unwrap()
        .is_none());

    let financial = assert_financial_identity(&fixture);
    assert_eq!(total_of(&financial, "F001", month(2024, 11)), Some(dec!(4600.00)));

    // Reruns reproduce the bonus rows exactly
    let first = fixture.digests();
    fixture.run(&config, stamp(2024, 11, 26));
    assert_eq!(fixture.digests(), first);
}

#[test]
fn test_schema_generation() {
    let schema = KpiRules::schema_as_json().unwrap();
    assert!(schema.contains("commission"));
    assert!(schema.contains("refundable_kpis"));
}
