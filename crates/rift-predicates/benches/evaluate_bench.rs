use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rift_predicates::{Evaluator, ImposterState, Predicate, Request, Value};
use serde_json::json;

fn create_request() -> Value {
    Request::new("POST", "/api/v1/orders")
        .with_header("Content-Type", "application/json")
        .with_header("X-Request-Id", "abc-123")
        .with_query("page", "2")
        .with_query("tag", "new")
        .with_body(r#"{"order": {"id": 42, "items": [{"sku": "A1"}, {"sku": "B2"}]}}"#)
        .to_value()
}

fn parse(node: serde_json::Value) -> Predicate {
    Predicate::parse(&node).unwrap()
}

fn bench_operators(c: &mut Criterion) {
    let mut group = c.benchmark_group("operators");
    let evaluator = Evaluator::new();
    let state = ImposterState::new();
    let request = create_request();

    let cases = [
        ("equals", json!({"equals": {"method": "POST", "path": "/api/v1/orders"}})),
        ("deep_equals", json!({"deepEquals": {"query": {"page": 2, "tag": "new"}}})),
        ("contains", json!({"contains": {"headers": {"x-request-id": "123"}}})),
        ("matches", json!({"matches": {"path": "^/api/v\\d+/orders$"}})),
        ("exists", json!({"exists": {"headers": {"content-type": true}}})),
        ("body_json", json!({"equals": {"body": {"order": {"id": 42}}}})),
        (
            "jsonpath",
            json!({"equals": {"body": "b2", "bodyEncoding": "utf8"}, "jsonpath": {"selector": "$.order.items[1].sku"}}),
        ),
    ];

    for (name, node) in cases {
        let predicate = parse(node);
        group.throughput(Throughput::Elements(1));
        group.bench_function(name, |b| {
            b.iter(|| {
                evaluator
                    .evaluate(black_box(&predicate), black_box(&request), &state)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_stub_predicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("stub_predicates");
    let evaluator = Evaluator::new();
    let state = ImposterState::new();
    let request = create_request();

    for count in [1, 5, 20, 50].iter() {
        let predicates: Vec<Predicate> = (0..*count)
            .map(|_| parse(json!({"startsWith": {"path": "/api/v1"}, "except": "\\d+"})))
            .collect();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("all_match", count), count, |b, _| {
            b.iter(|| {
                evaluator
                    .all_match(black_box(&predicates), black_box(&request), &state)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_nested_logic(c: &mut Criterion) {
    let mut group = c.benchmark_group("nested_logic");
    let evaluator = Evaluator::new();
    let state = ImposterState::new();
    let request = create_request();

    for depth in [1, 4, 16].iter() {
        let mut node = json!({"equals": {"method": "POST"}});
        for _ in 0..*depth {
            node = json!({"and": [{"not": {"equals": {"method": "GET"}}}, node]});
        }
        let predicate = parse(node);

        group.bench_with_input(BenchmarkId::new("and_not", depth), depth, |b, _| {
            b.iter(|| {
                evaluator
                    .evaluate(black_box(&predicate), black_box(&request), &state)
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_operators,
    bench_stub_predicates,
    bench_nested_logic
);
criterion_main!(benches);
