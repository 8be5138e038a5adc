/// Criterion benchmarks for the training step.
///
/// Measures forward latency and one full phase-2 style step
/// (three forwards + backward + AdamW) across a d_model sweep.
///
/// Run: cargo bench --bench train_step_bench
/// Reports saved to: target/criterion/

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use oocl_core::adamw::{clip_grad_norm, AdamW, AdamWConfig};
use oocl_core::gradient::accumulate_objective;
use oocl_core::loss::{binop_loss_grad, linkage_loss_grad};
use oocl_core::model::{Transformer, TransformerConfig};
use oocl_core::stream::{BatchStream, LinkageStream, SampleStream};
use oocl_core::table::{make_table_masks, Operation};
use oocl_core::vocab::Vocab;
use rand::SeedableRng;
use rand::rngs::StdRng;

const MOD: usize = 97;
const BATCH: usize = 32;

fn make_model(d: usize) -> Transformer {
    let cfg = TransformerConfig {
        d_model: d,
        d_head: d / 4,
        ..TransformerConfig::default()
    }
    .with_vocab(2 * MOD + 4);
    Transformer::new(cfg, 42).unwrap()
}

fn make_streams() -> (SampleStream, SampleStream, LinkageStream) {
    let vocab = Vocab::new(MOD).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let split = make_table_masks(MOD, Operation::SumOfSquares, 0.6, &mut rng).unwrap();
    let alias = split.coords.offset(MOD);
    let p1 = SampleStream::seeded(BATCH, &split.coords, &split.train, vocab, 1, "train").unwrap();
    let p2 = SampleStream::seeded(BATCH, &alias, &split.train, vocab, 2, "train").unwrap();
    let ln = LinkageStream::seeded(BATCH, vocab, 3).unwrap();
    (p1, p2, ln)
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    for d in [32, 64, 128] {
        let model = make_model(d);
        let (mut p1, _, _) = make_streams();
        let batch = p1.next_batch();
        group.bench_with_input(BenchmarkId::new("logits", format!("d={d}")), &d, |b, _| {
            b.iter(|| model.logits(&batch).unwrap())
        });
    }
    group.finish();
}

fn bench_train_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_step");
    group.sample_size(20);
    for d in [32, 64, 128] {
        let mut model = make_model(d);
        let (mut p1, mut p2, mut ln) = make_streams();
        let mut opt = AdamW::new(&model.params, AdamWConfig::default());
        let mut grads = model.zero_grads();
        group.bench_with_input(BenchmarkId::new("phase2", format!("d={d}")), &d, |b, _| {
            b.iter(|| {
                grads.zero();
                let (b1, b2, b3) = (p1.next_batch(), p2.next_batch(), ln.next_batch());
                accumulate_objective(&model, &b1, binop_loss_grad, 1.0, &mut grads).unwrap();
                accumulate_objective(&model, &b2, binop_loss_grad, 1.0, &mut grads).unwrap();
                accumulate_objective(&model, &b3, linkage_loss_grad, 1.0, &mut grads).unwrap();
                clip_grad_norm(&mut grads, 1.0);
                opt.step(&mut model.params, &grads, 1e-3);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_forward, bench_train_step);
criterion_main!(benches);
