//! Throughput benchmarks for Pass 0, the end-to-end block recompiler, and
//! Pass 2's jump resolution.

use std::cell::RefCell;
use std::rc::Rc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use recompiler_core::config::PAGE_INSTR_COUNT;
use recompiler_core::mips::{opcode, special_function, GuestInstruction};
use recompiler_core::testkit::{
    BumpCache, CountingRegisterMapper, IdentityMemoryTranslator, RecordingCacheMaintenance,
    ScriptedTranslator,
};
use recompiler_core::{analyze_pass0, recompile_block, PageRegistry, RecompilerConfig};

fn nop() -> GuestInstruction {
    GuestInstruction::new(0)
}

fn jr_ra() -> GuestInstruction {
    GuestInstruction::new((opcode::SPECIAL << 26) | (31 << 21) | special_function::JR)
}

fn beq(disp: i16) -> GuestInstruction {
    GuestInstruction::new((opcode::BEQ << 26) | (disp as u16 as u32))
}

/// A page holding `count` NOPs, a branch back to the top every 8
/// instructions, then `JR RA` and its delay slot.
fn branchy_page(count: usize) -> [GuestInstruction; PAGE_INSTR_COUNT] {
    let mut page = [GuestInstruction::default(); PAGE_INSTR_COUNT];
    let count = count.min(PAGE_INSTR_COUNT - 4);
    for i in 0..count {
        page[i] = if i > 0 && i % 8 == 0 { beq(-7) } else { nop() };
    }
    page[count] = jr_ra();
    page[count + 1] = nop();
    page
}

fn bench_pass0(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze_pass0");
    for &count in &[16usize, 128, 512, 1000] {
        let page = branchy_page(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| analyze_pass0(black_box(&page), black_box(0x8000_0000), black_box(0)).unwrap());
        });
    }
    group.finish();
}

fn bench_recompile_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("recompile_block");
    for &count in &[16usize, 128, 512, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let guest_code = Rc::new(RefCell::new(branchy_page(count)));
                    let mut registry = PageRegistry::new();
                    let mem = IdentityMemoryTranslator;
                    let page = recompiler_core::init_block(&mut registry, 0x8000_0000, guest_code, &mem);
                    (
                        page,
                        ScriptedTranslator,
                        CountingRegisterMapper::default(),
                        BumpCache::default(),
                        RecordingCacheMaintenance::default(),
                        RecompilerConfig::default(),
                    )
                },
                |(page, mut translator, mut rm, mut cache, mut maint, config)| {
                    recompile_block(
                        black_box(&page),
                        0x8000_0000,
                        &config,
                        &mut translator,
                        &mut rm,
                        &mut cache,
                        &mut maint,
                    )
                    .unwrap();
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

/// Repeated recompiles at the same entry point, which exercises the
/// overlap-eviction path instead of a cold function allocation.
fn bench_recompile_with_eviction(c: &mut Criterion) {
    c.bench_function("recompile_block/re-recompile-same-entry", |b| {
        let guest_code = Rc::new(RefCell::new(branchy_page(64)));
        let mut registry = PageRegistry::new();
        let mem = IdentityMemoryTranslator;
        let page = recompiler_core::init_block(&mut registry, 0x8000_0000, guest_code, &mem);
        let mut translator = ScriptedTranslator;
        let mut rm = CountingRegisterMapper::default();
        let mut cache = BumpCache::default();
        let mut maint = RecordingCacheMaintenance::default();
        let config = RecompilerConfig::default();

        b.iter(|| {
            recompile_block(
                black_box(&page),
                0x8000_0000,
                &config,
                &mut translator,
                &mut rm,
                &mut cache,
                &mut maint,
            )
            .unwrap();
        });
    });
}

criterion_group!(benches, bench_pass0, bench_recompile_block, bench_recompile_with_eviction);
criterion_main!(benches);
