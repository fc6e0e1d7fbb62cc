// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![expect(missing_docs, reason = "Benchmark code")]

use std::alloc::System;
use std::hint::black_box;

use alloc_tracker::{Allocator, Session};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use nativebuf::{BufferReader, CharBuffer, CharBufferPool, NativeBuffer};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<System> = Allocator::system();

// Roughly the size of a long file system path.
const TEST_TEXT: &str = r"C:\Users\someone\AppData\Local\Packages\Some.Application_8wekyb3d8bbwe\LocalState\cache\entry.dat";

const SEPARATOR: u16 = 0x5C;

fn entrypoint(c: &mut Criterion) {
    let allocs = Session::new();

    char_buffer(c, &allocs);
    pool(c, &allocs);
    reader(c, &allocs);

    allocs.print_to_stdout();
}

fn char_buffer(c: &mut Criterion, allocs: &Session) {
    let test_units: Vec<u16> = TEST_TEXT.encode_utf16().collect();
    let filled: CharBuffer = TEST_TEXT.parse().unwrap();

    let mut group = c.benchmark_group("CharBuffer");

    let allocs_op = allocs.operation("append_str_empty");
    group.bench_function("append_str_empty", |b| {
        b.iter_batched_ref(
            CharBuffer::new,
            |buffer| {
                let _span = allocs_op.measure_thread();
                buffer.append_str(black_box(TEST_TEXT), 0, None).unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    let allocs_op = allocs.operation("append_utf16_presized");
    group.bench_function("append_utf16_presized", |b| {
        b.iter_batched_ref(
            || CharBuffer::with_char_capacity(1024).unwrap(),
            |buffer| {
                let _span = allocs_op.measure_thread();
                buffer.append_utf16(black_box(&test_units), 0, None).unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    let allocs_op = allocs.operation("push_repeated");
    group.bench_function("push_repeated", |b| {
        b.iter_batched_ref(
            CharBuffer::new,
            |buffer| {
                let _span = allocs_op.measure_thread();
                buffer.push_repeated(black_box(0x20), 256).unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    let allocs_op = allocs.operation("append_buffer");
    group.bench_function("append_buffer", |b| {
        b.iter_batched_ref(
            CharBuffer::new,
            |buffer| {
                let _span = allocs_op.measure_thread();
                buffer.append_buffer(&filled, 0, None).unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    let allocs_op = allocs.operation("split");
    group.bench_function("split", |b| {
        b.iter(|| {
            let _span = allocs_op.measure_thread();
            filled.split(black_box(SEPARATOR), false).unwrap()
        });
    });

    let allocs_op = allocs.operation("to_string");
    group.bench_function("to_string", |b| {
        b.iter(|| {
            let _span = allocs_op.measure_thread();
            filled.to_string().unwrap()
        });
    });

    group.bench_function("index_of", |b| {
        b.iter(|| filled.index_of(black_box(u16::from(b'.')), 0));
    });

    group.finish();
}

fn pool(c: &mut Criterion, allocs: &Session) {
    let pool = CharBufferPool::new(4);
    let mut group = c.benchmark_group("CharBufferPool");

    let allocs_op = allocs.operation("cached_invoke_pooled");
    group.bench_function("cached_invoke_pooled", |b| {
        b.iter(|| {
            let _span = allocs_op.measure_thread();
            pool.cached_invoke(|buffer| buffer.append_str(black_box(TEST_TEXT), 0, None))
                .unwrap()
                .unwrap();
        });
    });

    let allocs_op = allocs.operation("cached_invoke_unpooled");
    group.bench_function("cached_invoke_unpooled", |b| {
        b.iter(|| {
            let _span = allocs_op.measure_thread();
            CharBufferPool::global()
                .cached_invoke(|buffer| buffer.append_str(black_box(TEST_TEXT), 0, None))
                .unwrap()
                .unwrap();
        });
    });

    group.finish();
}

fn reader(c: &mut Criterion, allocs: &Session) {
    let mut buffer = NativeBuffer::with_byte_capacity(4096).unwrap();
    for (index, byte) in buffer.as_bytes_mut().iter_mut().enumerate() {
        *byte = u8::try_from(index % 251).unwrap();
    }

    let mut group = c.benchmark_group("BufferReader");

    group.bench_function("read_u64_aligned", |b| {
        b.iter(|| {
            let mut reader = BufferReader::new(&buffer);
            let mut sum = 0_u64;
            while let Ok(value) = reader.read_u64() {
                sum = sum.wrapping_add(value);
            }
            sum
        });
    });

    group.bench_function("read_u64_unaligned", |b| {
        b.iter(|| {
            let mut reader = BufferReader::new(&buffer);
            reader.set_byte_offset(1).unwrap();
            let mut sum = 0_u64;
            while let Ok(value) = reader.read_u64() {
                sum = sum.wrapping_add(value);
            }
            sum
        });
    });

    let allocs_op = allocs.operation("read_string");
    group.bench_function("read_string", |b| {
        b.iter(|| {
            let _span = allocs_op.measure_thread();
            BufferReader::new(&buffer).read_string(black_box(512)).unwrap()
        });
    });

    group.finish();
}
