//! Benchmarks for wsinfra core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use wsinfra::core::environment::EnvironmentNormalizer;
use wsinfra::core::hasher;
use wsinfra::core::installer::{InstallerResolver, MemoryInstallerRegistry};
use wsinfra::core::parser;
use wsinfra::core::recipe::RecipeResolver;
use wsinfra::core::types::{Environment, Installer, ServerConfig};

const ENVIRONMENT: &str = r#"
recipe:
  type: script
  content: |
    apt-get update
    apt-get install -y curl git
machines:
  dev:
    installers: [exec, terminal, ls]
    attributes:
      memoryLimitBytes: "2147483648"
      env.JAVA_HOME: /usr/lib/jvm/default
    servers:
      web:
        port: "8080"
        protocol: HTTP
  db:
    servers:
      pg:
        port: "5432"
"#;

/// Linear chain `node-0000 <- node-0001 <- ...` of `n` installers.
fn chain(n: usize) -> MemoryInstallerRegistry {
    MemoryInstallerRegistry::from_installers((0..n).map(|i| Installer {
        id: format!("node-{i:04}"),
        version: "latest".into(),
        dependencies: if i > 0 {
            vec![format!("node-{:04}", i - 1)]
        } else {
            Vec::new()
        },
        ..Installer::default()
    }))
}

fn agents() -> MemoryInstallerRegistry {
    let mut exec = Installer {
        id: "exec".into(),
        version: "latest".into(),
        ..Installer::default()
    };
    exec.servers
        .insert("exec".into(), ServerConfig::new("4412/tcp", Some("ws")));
    let mut terminal = Installer {
        id: "terminal".into(),
        version: "latest".into(),
        dependencies: vec!["exec".into()],
        ..Installer::default()
    };
    terminal
        .servers
        .insert("terminal".into(), ServerConfig::new("4411/tcp", Some("ws")));
    let ls = Installer {
        id: "ls".into(),
        version: "latest".into(),
        dependencies: vec!["terminal".into()],
        ..Installer::default()
    };
    MemoryInstallerRegistry::from_installers([exec, terminal, ls])
}

fn bench_environment_parse(c: &mut Criterion) {
    c.bench_function("environment_parse_validate", |b| {
        b.iter(|| {
            let env = parser::parse_environment(black_box(ENVIRONMENT)).unwrap();
            black_box(parser::validate_environment(&env));
        });
    });
}

fn bench_installer_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("installer_resolution");
    for n in [10, 50, 100] {
        let registry = chain(n);
        let keys = vec![format!("node-{:04}", n - 1)];
        group.bench_with_input(BenchmarkId::from_parameter(n), &keys, |b, keys| {
            b.iter(|| {
                let order = InstallerResolver::resolve(black_box(keys), &registry).unwrap();
                black_box(order);
            });
        });
    }
    group.finish();
}

fn bench_normalize(c: &mut Criterion) {
    let env: Environment = parser::parse_environment(ENVIRONMENT).unwrap();
    let registry = agents();
    let recipes = RecipeResolver::default();
    c.bench_function("environment_normalize", |b| {
        b.iter(|| {
            let internal = EnvironmentNormalizer::new(&registry, &recipes)
                .normalize(black_box(&env))
                .unwrap();
            black_box(internal);
        });
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let env = parser::normalize_environment(
        &parser::parse_environment(ENVIRONMENT).unwrap(),
        "text/x-shellscript",
    );
    c.bench_function("environment_fingerprint", |b| {
        b.iter(|| {
            black_box(hasher::fingerprint(black_box(&env)).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_environment_parse,
    bench_installer_resolution,
    bench_normalize,
    bench_fingerprint
);
criterion_main!(benches);
