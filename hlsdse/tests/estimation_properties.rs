//! QoR estimation properties
//!
//! Closed-form checks of the loop model, linearity of resources in the
//! unroll and partition factors, dataflow granularity, unknown-latency
//! propagation, saturation of huge counts, and idempotence of incremental
//! re-estimation.

use hlsdse::cost_model::STORAGE_BANK_BITS;
use hlsdse::metrics::{Cycles, Metrics, ResourceKind};
use hlsdse::qor_estimation::{run_qor_estimation, QoREstimator};
use hlsdse::region::{
    ArrayDecl, BlockBody, LoopDirectives, MemAccess, Module, ModuleBuilder, ModuleFile, OpKind,
    Operation, RegionId, Storage, TripCount,
};
use hlsdse::target_spec::TargetSpec;
use hlsdse::transforms::{ParamTarget, ParamValue};

/// Three on-chip reads of A per iteration, one single-bank dual-port memory
fn stencil(trip: u64, directives: LoopDirectives) -> (Module, RegionId) {
    let mut b = ModuleBuilder::new("stencil");
    let f = b.func(None, "stencil");
    let l = b.loop_(f, "i", TripCount::Static(trip));
    b.block(
        l,
        BlockBody {
            ops: vec![Operation::new(OpKind::FAdd, 32)],
            accesses: vec![
                MemAccess::read("A", &["i"]).unwrap(),
                MemAccess::read("A", &["i+1"]).unwrap(),
                MemAccess::read("A", &["i+2"]).unwrap(),
            ],
        },
    );
    b.directives(l, directives);
    b.array(ArrayDecl::new("A", &[trip + 2], Storage::Local));
    (b.build().unwrap(), l)
}

fn calibrated() -> TargetSpec {
    let mut target = TargetSpec::default();
    target.op_latency.insert("load".to_string(), 1);
    target.op_latency.insert("fadd".to_string(), 2);
    target
}

#[test]
fn test_pipelined_latency_formula() {
    // depth = 3 loads + fadd = 5; 3 requests on 2 ports -> II = 2
    let (mut module, l) = stencil(
        100,
        LoopDirectives {
            pipeline: true,
            ..Default::default()
        },
    );
    run_qor_estimation(&mut module, Some(&calibrated())).unwrap();
    let m = module.metrics_table().metrics(l).unwrap();
    assert_eq!(m.interval, Cycles::Known(2));
    assert_eq!(m.latency, Cycles::Known(204));
}

#[test]
fn test_sequential_loop_is_trip_times_body() {
    let (mut module, l) = stencil(100, LoopDirectives::default());
    run_qor_estimation(&mut module, Some(&calibrated())).unwrap();
    // Body 5 cycles plus one stall cycle for the third read
    assert_eq!(
        module.metrics_table().metrics(l).unwrap().latency,
        Cycles::Known(100 * 6)
    );
}

#[test]
fn test_compute_units_scale_with_unroll() {
    let units = |unroll: u64| {
        let (mut module, l) = stencil(
            64,
            LoopDirectives {
                unroll,
                ..Default::default()
            },
        );
        run_qor_estimation(&mut module, None).unwrap();
        module.metrics_table().metrics(l).unwrap().resources.compute_units
    };
    let base = units(1);
    assert_eq!(base, 2);
    assert_eq!(units(2), 2 * base);
    assert_eq!(units(4), 4 * base);
}

#[test]
fn test_storage_scales_with_partition() {
    let storage = |factor: u64| {
        let (mut module, _) = stencil(64, LoopDirectives::default());
        // Extent 66 is divisible by 1, 2 and 3
        module
            .set_param(&ParamTarget::Partition("A".to_string()), ParamValue::Factor(factor))
            .unwrap();
        run_qor_estimation(&mut module, None)
            .unwrap()
            .metrics
            .resources
            .storage_elements
    };
    assert_eq!(storage(1), 1);
    assert_eq!(storage(2), 2);
    assert_eq!(storage(3), 3);
}

#[test]
fn test_unknown_trip_count_propagates_to_root() {
    let mut b = ModuleBuilder::new("mixed");
    let f = b.func(None, "mixed");
    let known = b.loop_(f, "i", TripCount::Static(8));
    b.block(
        known,
        BlockBody {
            ops: vec![Operation::new(OpKind::Mul, 32)],
            accesses: vec![],
        },
    );
    let symbolic = b.loop_(f, "j", TripCount::Symbolic("N".to_string()));
    b.block(
        symbolic,
        BlockBody {
            ops: vec![Operation::new(OpKind::FMul, 32)],
            accesses: vec![],
        },
    );
    let zero = b.loop_(f, "k", TripCount::Static(0));
    b.block(zero, BlockBody::default());
    let mut module = b.build().unwrap();

    let summary = run_qor_estimation(&mut module, None).unwrap();
    let table = module.metrics_table();
    assert!(table.metrics(known).unwrap().latency.known().is_some());
    assert!(table.metrics(symbolic).unwrap().is_unknown());
    assert!(table.metrics(zero).unwrap().is_unknown());
    assert_eq!(summary.metrics.latency, Cycles::Unknown);
    // Resources are still reported
    assert_eq!(summary.metrics.resources.compute_units, 3);
}

#[test]
fn test_dataflow_overlaps_children() {
    let build = |stages: u64| {
        let mut b = ModuleBuilder::new("producer_consumer");
        let f = b.func(None, "pc");
        let produce = b.loop_(f, "i", TripCount::Static(32));
        b.block(
            produce,
            BlockBody {
                ops: vec![Operation::new(OpKind::Mul, 32)],
                accesses: vec![MemAccess::write("T", &["i"]).unwrap()],
            },
        );
        let consume = b.loop_(f, "j", TripCount::Static(32));
        b.block(
            consume,
            BlockBody {
                ops: vec![Operation::new(OpKind::Add, 32)],
                accesses: vec![MemAccess::read("T", &["j"]).unwrap()],
            },
        );
        b.array(ArrayDecl::new("T", &[32], Storage::Local));
        let mut module = b.build().unwrap();
        module
            .set_param(&ParamTarget::Dataflow(f), ParamValue::Factor(stages))
            .unwrap();
        run_qor_estimation(&mut module, None).unwrap().metrics
    };
    let sequential = build(1);
    let overlapped = build(2);
    assert!(overlapped.latency.known().unwrap() < sequential.latency.known().unwrap());
    // Shared buffer is double-buffered, compute units add up
    assert_eq!(
        overlapped.resources.storage_elements,
        2 * sequential.resources.storage_elements
    );
    assert_eq!(overlapped.resources.compute_units, 3 + 1);
    assert_eq!(sequential.resources.compute_units, 3);
}

/// Producer/consumer pairs over `T` and `U`, four children of equal shape
fn two_pairs(stages: u64) -> Metrics {
    let mut b = ModuleBuilder::new("two_pairs");
    let f = b.func(None, "two_pairs");
    for (iv, access) in [
        ("a", MemAccess::write("T", &["a"])),
        ("b", MemAccess::read("T", &["b"])),
        ("c", MemAccess::write("U", &["c"])),
        ("d", MemAccess::read("U", &["d"])),
    ] {
        let l = b.loop_(f, iv, TripCount::Static(32));
        b.block(
            l,
            BlockBody {
                ops: vec![Operation::new(OpKind::Mul, 32)],
                accesses: vec![access.unwrap()],
            },
        );
    }
    b.array(ArrayDecl::new("T", &[32], Storage::Local));
    b.array(ArrayDecl::new("U", &[32], Storage::Local));
    let mut module = b.build().unwrap();
    module
        .set_param(&ParamTarget::Dataflow(f), ParamValue::Factor(stages))
        .unwrap();
    run_qor_estimation(&mut module, None).unwrap().metrics
}

#[test]
fn test_dataflow_granularity() {
    let one = two_pairs(1);
    let two = two_pairs(2);
    let four = two_pairs(4);
    let latency = |m: &Metrics| m.latency.known().unwrap();
    assert!(latency(&two) < latency(&one));
    assert!(latency(&four) < latency(&two));

    // One multiplier per stage
    assert_eq!(one.resources.compute_units, 3);
    assert_eq!(two.resources.compute_units, 6);
    assert_eq!(four.resources.compute_units, 12);

    // Each pair shares a stage at k = 2, so only k = 4 double-buffers
    assert_eq!(one.resources.storage_elements, 2);
    assert_eq!(two.resources.storage_elements, 2);
    assert_eq!(four.resources.storage_elements, 4);
}

#[test]
fn test_balanced_stages_follow_latency() {
    let build = |balance: bool| {
        let json = format!(
            r#"{{
                "name": "uneven",
                "regions": [
                    {{"id": 0, "kind": "func", "name": "uneven",
                     "directives": {{"dataflow": 2, "balance": {}}}}},
                    {{"id": 1, "parent": 0, "kind": "loop", "iv": "i", "trip": 64}},
                    {{"id": 2, "parent": 1, "kind": "block", "ops": [{{"kind": "mul"}}]}},
                    {{"id": 3, "parent": 0, "kind": "loop", "iv": "j", "trip": 8}},
                    {{"id": 4, "parent": 3, "kind": "block", "ops": [{{"kind": "mul"}}]}},
                    {{"id": 5, "parent": 0, "kind": "loop", "iv": "k", "trip": 8}},
                    {{"id": 6, "parent": 5, "kind": "block", "ops": [{{"kind": "mul"}}]}}
                ]
            }}"#,
            balance
        );
        let file: ModuleFile = serde_json::from_str(&json).unwrap();
        let mut module = Module::from_file(file).unwrap();
        run_qor_estimation(&mut module, None).unwrap().metrics
    };
    // Even split pairs the long loop with a short one; balancing isolates it
    let even = build(false).latency.known().unwrap();
    let balanced = build(true).latency.known().unwrap();
    assert!(balanced < even);
}

#[test]
fn test_huge_shapes_saturate() {
    let mut b = ModuleBuilder::new("huge");
    let f = b.func(None, "huge");
    let l = b.loop_(f, "i", TripCount::Static(16));
    b.block(
        l,
        BlockBody {
            ops: vec![Operation::new(OpKind::Add, 32)],
            accesses: vec![MemAccess::read("A", &["i", "0"]).unwrap()],
        },
    );
    b.array(ArrayDecl::new("A", &[1 << 31, 1 << 31], Storage::Local));
    let mut module = b.build().unwrap();
    let summary = run_qor_estimation(&mut module, None).unwrap();
    assert_eq!(
        summary.metrics.resources.storage_elements,
        u64::MAX / STORAGE_BANK_BITS + 1
    );
    assert!(summary.metrics.latency.known().is_some());

    let mut b = ModuleBuilder::new("long");
    let f = b.func(None, "long");
    let i = b.loop_(f, "i", TripCount::Static(1 << 40));
    let j = b.loop_(i, "j", TripCount::Static(1 << 40));
    b.block(
        j,
        BlockBody {
            ops: vec![Operation::new(OpKind::Add, 32)],
            accesses: vec![],
        },
    );
    let mut module = b.build().unwrap();
    let summary = run_qor_estimation(&mut module, None).unwrap();
    assert_eq!(summary.metrics.latency, Cycles::Known(u64::MAX));

    // A huge calibrated latency inside a pipelined reduction
    let (mut module, l) = stencil(
        64,
        LoopDirectives {
            pipeline: true,
            unroll: 4,
            tile: None,
        },
    );
    let mut target = TargetSpec::default();
    target.op_latency.insert("fadd".to_string(), u64::MAX);
    run_qor_estimation(&mut module, Some(&target)).unwrap();
    let m = module.metrics_table().metrics(l).unwrap();
    assert!(m.latency.known().unwrap() >= u64::MAX - 1);
}

#[test]
fn test_aggregation_is_idempotent() {
    let (mut module, _) = stencil(
        100,
        LoopDirectives {
            pipeline: true,
            unroll: 4,
            tile: None,
        },
    );
    let estimator = QoREstimator::new(Some(&calibrated()));
    let first = estimator.run(&mut module).unwrap();
    let table = module.metrics_table().clone();
    // Refreshing a fully estimated module recomputes nothing
    assert_eq!(estimator.refresh(&mut module), first.metrics);
    let second = estimator.run(&mut module).unwrap();
    assert_eq!(first, second);
    assert_eq!(&table, module.metrics_table());
}

#[test]
fn test_revert_restores_metrics_exactly() {
    let (mut module, l) = stencil(64, LoopDirectives::default());
    let estimator = QoREstimator::default();
    estimator.run(&mut module).unwrap();
    let before_file = module.to_file();
    let before_table = module.metrics_table().clone();

    let delta = module
        .set_param(&ParamTarget::Unroll(l), ParamValue::Factor(8))
        .unwrap();
    let changed = estimator.refresh(&mut module);
    assert_ne!(Some(&changed), before_table.metrics(module.root()));

    module.restore(&delta).unwrap();
    estimator.refresh(&mut module);
    assert_eq!(module.to_file(), before_file);
    assert_eq!(module.metrics_table(), &before_table);
}

#[test]
fn test_budget_violations_are_reported() {
    let (mut module, l) = stencil(
        64,
        LoopDirectives {
            unroll: 8,
            ..Default::default()
        },
    );
    let target = TargetSpec::default()
        .with_budget(ResourceKind::ComputeUnit, 4)
        .with_budget(ResourceKind::MemoryPort, 64);
    let summary = run_qor_estimation(&mut module, Some(&target)).unwrap();
    assert!(summary.violating_regions.contains(&l));
    let violations = &module.metrics_table().get(l).unwrap().violations;
    assert_eq!(violations.len(), 1);
}

#[test]
fn test_tiling_external_array_adds_buffer() {
    let mut b = ModuleBuilder::new("rowsum");
    let f = b.func(None, "rowsum");
    let i = b.loop_(f, "i", TripCount::Static(32));
    let j = b.loop_(i, "j", TripCount::Static(32));
    b.block(
        j,
        BlockBody {
            ops: vec![Operation::new(OpKind::FAdd, 32)],
            accesses: vec![
                MemAccess::read("M", &["i", "j"]).unwrap(),
                MemAccess::read("s", &["i"]).unwrap(),
                MemAccess::write("s", &["i"]).unwrap(),
            ],
        },
    );
    b.array(ArrayDecl::new("M", &[32, 32], Storage::External));
    b.array(ArrayDecl::new("s", &[32], Storage::Local));
    let mut module = b.build().unwrap();

    let untiled = run_qor_estimation(&mut module, None).unwrap().metrics;
    module
        .set_param(&ParamTarget::Tile(i), ParamValue::Factor(8))
        .unwrap();
    let tiled = run_qor_estimation(&mut module, None).unwrap().metrics;
    // 8 x 32 tile of M: 8192 bits fits one storage element
    assert_eq!(
        tiled.resources.storage_elements,
        untiled.resources.storage_elements + 1
    );
    assert!(tiled.latency.known().unwrap() < untiled.latency.known().unwrap());
}
