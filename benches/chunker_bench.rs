use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use spoolrelay::chunker::{collect_files, Chunker, SourceFile};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn make_source_file(i: usize, size: u64) -> SourceFile {
    SourceFile {
        relative: PathBuf::from(format!("example.com/dir{}/file{}.html", i % 16, i)),
        size,
    }
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunker_plan");

    for file_count in [100, 1000, 10000].iter() {
        // Mix of small pages and a few large assets
        let files: Vec<_> = (0..*file_count)
            .map(|i| make_source_file(i, if i % 50 == 0 { 700 * 1024 } else { 8 * 1024 }))
            .collect();
        let chunker = Chunker::new(500);

        group.bench_with_input(
            BenchmarkId::from_parameter(file_count),
            file_count,
            |b, _| {
                b.iter(|| chunker.plan(black_box(&files)));
            },
        );
    }
    group.finish();
}

fn bench_collect_files(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect_files");

    for file_count in [100, 1000].iter() {
        let tmp = TempDir::new().unwrap();
        for i in 0..*file_count {
            let path = tmp.path().join(format!("example.com/dir{}/file{}.html", i % 16, i));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"<html></html>").unwrap();
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(file_count),
            file_count,
            |b, _| {
                b.iter(|| collect_files(black_box(tmp.path())).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_plan, bench_collect_files);
criterion_main!(benches);
