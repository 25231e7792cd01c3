use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reactorhttp::http::{Method, Router, StatusCode};

fn handler() -> reactorhttp::http::router::Handler {
    Arc::new(|_req, _conn, resp| {
        resp.set_status(StatusCode::Ok);
        true
    })
}

fn build_router(routes: usize) -> Router {
    let mut router = Router::new();
    for i in 0..routes {
        router
            .add_route(&format!("/resource{i}/:id"), Method::Get, handler())
            .unwrap();
    }
    router
        .add_route("/resource0/:id/items/:item", Method::Get, handler())
        .unwrap();
    router
}

fn lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_find");
    for &routes in &[8usize, 64, 512] {
        let router = build_router(routes);
        group.bench_with_input(
            criterion::BenchmarkId::new("exact_and_param", routes),
            &routes,
            |b, _| {
                b.iter(|| {
                    black_box(router.find("/resource0/42", Method::Get));
                    black_box(router.find("/resource0/42/items/7", Method::Get));
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, lookup);
criterion_main!(benches);
