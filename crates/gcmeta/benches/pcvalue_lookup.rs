use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gcmeta::{
    FrameContext, FrameScanner, FuncRecord, MetadataImage, PcValueEncoder, RoutineBuilder,
    RoutineDecl, ScanOptions, Target,
};

fn table_with_ranges(ranges: u32) -> gcmeta::PcTable {
    let mut enc = PcValueEncoder::new(1);
    for i in 0..ranges {
        enc.declare(i * 8, (i % 7) as i32).unwrap();
    }
    enc.finish(ranges * 8).unwrap()
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("pcvalue_lookup");

    for ranges in [4u32, 64, 1024] {
        let table = table_with_ranges(ranges);
        let last = ranges * 8 - 1;
        group.bench_with_input(BenchmarkId::new("last_pc", ranges), &table, |b, table| {
            b.iter(|| table.lookup(1, black_box(last)).unwrap());
        });
    }

    group.finish();
}

fn bench_find_func(c: &mut Criterion) {
    let mut image = MetadataImage::new(Target::AMD64);
    for i in 0..4096u64 {
        image
            .add_function(FuncRecord::new(format!("f{}", i), 0x1000 + i * 0x100, 0x80))
            .unwrap();
    }

    c.bench_function("find_func", |b| {
        b.iter(|| image.find_func(black_box(0x1000 + 2048 * 0x100 + 0x40)));
    });
}

fn bench_scan_frame(c: &mut Criterion) {
    let mut decl = RoutineDecl::new("f", 0x1000, 256);
    decl.frame_size = 64;
    let mut builder = RoutineBuilder::new(decl, Target::AMD64);
    let mut map = gcmeta::StackMap::new(8);
    for i in 0..8 {
        map.push(gcmeta::BitVector::with_bits(8, &[i]));
    }
    builder
        .funcdata(0, gcmeta::FuncdataSlot::LocalsPointerMaps, map.encode())
        .unwrap();
    for i in 0..8 {
        builder
            .pcdata(i * 32, gcmeta::PcdataChannel::StackMapIndex, i as i32)
            .unwrap();
    }
    let mut image = MetadataImage::new(Target::AMD64);
    image.add_function(builder.finish().unwrap()).unwrap();

    let scanner = FrameScanner::new(&image, ScanOptions::default());
    let frame = FrameContext {
        pc: 0x10f0,
        varp: 0x8000,
        argp: 0x8100,
        at_call: true,
    };

    c.bench_function("scan_frame", |b| {
        b.iter(|| scanner.scan_frame(black_box(&frame)).unwrap());
    });
}

criterion_group!(benches, bench_lookup, bench_find_func, bench_scan_frame);
criterion_main!(benches);
