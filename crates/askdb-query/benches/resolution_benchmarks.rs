//! Benchmarks for the rule-based half of a conversational turn.
//!
//! Window building, reference resolution, classification and SQL generation
//! run on every question, before the database is touched.

use askdb_core::config::GeneratorConfig;
use askdb_core::query::{CompareOp, Expr, Literal, Predicate, ResolvedQuerySpec};
use askdb_core::types::{
    ColumnInfo, DatabaseDescriptor, QueryClass, SchemaDescriptor, Session, SessionId, TableSchema,
    Turn,
};
use askdb_query::text::IdentifierMatcher;
use askdb_query::{ContextManager, DatabaseFamily, Dialect, QueryClassifier, ReferenceResolver, SqlGenerator};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn make_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(vec![
        TableSchema::new(
            "customers",
            vec![
                ColumnInfo::new("id", "INTEGER").primary_key(),
                ColumnInfo::new("name", "TEXT"),
                ColumnInfo::new("city", "TEXT"),
            ],
        ),
        TableSchema::new(
            "sales",
            vec![
                ColumnInfo::new("id", "INTEGER").primary_key(),
                ColumnInfo::new("customer_id", "INTEGER").references("customers", "id"),
                ColumnInfo::new("region", "TEXT"),
                ColumnInfo::new("year", "INTEGER"),
                ColumnInfo::new("amount", "REAL"),
            ],
        ),
    ])
}

fn make_session(turns: usize) -> Session {
    let mut session = Session::new(SessionId::new(), DatabaseDescriptor::new("sqlite", "bench"));
    for i in 0..turns {
        let year = 2000 + i as i64;
        let mut turn = Turn::new(session.session_id, format!("show sales for {year}"));
        turn.classification = QueryClass::Data;
        let mut spec = ResolvedQuerySpec::rows("sales");
        spec.filters.push(Predicate::new(
            Expr::column("sales", "year"),
            CompareOp::Eq,
            Literal::Integer(year),
        ));
        turn.generated_sql = Some(format!("SELECT * FROM sales WHERE year = {year}"));
        turn.query_spec = Some(spec);
        session.turns.push(turn);
    }
    session
}

fn bench_window(c: &mut Criterion) {
    let schema = make_schema();
    let session = make_session(50);
    let manager = ContextManager::default();

    c.bench_function("build_window_50_turns", |b| {
        b.iter(|| {
            black_box(manager.build_window(&session, black_box("what about 2020?"), Some(&schema)))
        })
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let schema = make_schema();
    let session = make_session(10);
    let manager = ContextManager::default();
    let resolver = ReferenceResolver::for_schema(&schema);
    let classifier = QueryClassifier::new(IdentifierMatcher::default());
    let generator = SqlGenerator::new(Dialect::new(DatabaseFamily::Sqlite), GeneratorConfig::default());

    c.bench_function("resolve_classify_generate_followup", |b| {
        b.iter(|| {
            let utterance = black_box("what about their totals by region?");
            let window = manager.build_window(&session, utterance, Some(&schema));
            let resolution = resolver.resolve(utterance, &window);
            let class =
                classifier.classify(&resolution.utterance, resolution.used_references, &window, &schema);
            black_box(generator.generate_rules(&resolution.utterance, &class, &window, &schema))
        })
    });

    c.bench_function("generate_fresh_join", |b| {
        let window = manager.build_window(&session, "", Some(&schema));
        let class = classifier.classify("total sales by customer name", false, &window, &schema);
        b.iter(|| {
            black_box(generator.generate_rules(
                black_box("total sales by customer name"),
                &class,
                &window,
                &schema,
            ))
        })
    });
}

criterion_group!(benches, bench_window, bench_pipeline);
criterion_main!(benches);
