use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kiln_engine::bytecode::decode;
use kiln_engine::jit::analysis::analyze;
use kiln_engine::jit::emit::{emit, EmitOptions};
use kiln_engine::{CodeUnit, Opcode};

fn op(code: &mut Vec<u8>, opcode: Opcode, arg: u8) {
    code.push(opcode.to_u8());
    code.push(arg);
}

/// `n` copies of `a = b + c; if a: b = a` over three arguments
fn straight_line(n: usize) -> CodeUnit {
    let mut code = Vec::new();
    for _ in 0..n {
        op(&mut code, Opcode::LoadFast, 1);
        op(&mut code, Opcode::LoadFast, 2);
        op(&mut code, Opcode::BinaryAdd, 0);
        op(&mut code, Opcode::StoreFast, 0);
        op(&mut code, Opcode::LoadFast, 0);
        op(&mut code, Opcode::PopJumpIfFalse, 0);
        op(&mut code, Opcode::LoadFast, 0);
        op(&mut code, Opcode::StoreFast, 1);
    }
    op(&mut code, Opcode::LoadConst, 0);
    op(&mut code, Opcode::ReturnValue, 0);

    // Patch each branch to skip its own store pair
    for block in 0..n {
        let vpc = block * 8;
        code[(vpc + 5) * 2 + 1] = (vpc + 8) as u8;
    }

    let mut unit = CodeUnit::new("bench", code, 3, 2);
    unit.argcount = 3;
    unit
}

fn bench_analyze(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze");
    for n in [4usize, 16, 30] {
        let unit = straight_line(n);
        let instrs = decode(&unit.code).unwrap();
        group.throughput(Throughput::Elements(instrs.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(instrs.len()), &instrs, |b, instrs| {
            b.iter(|| analyze(black_box(&unit), black_box(instrs)).unwrap());
        });
    }
    group.finish();
}

fn bench_emit(c: &mut Criterion) {
    let unit = straight_line(30);
    let instrs = decode(&unit.code).unwrap();
    let analysis = analyze(&unit, &instrs).unwrap();

    c.bench_function("emit_straight_line", |b| {
        b.iter(|| emit(black_box(&unit), &instrs, &analysis, EmitOptions::default()).unwrap());
    });
}

criterion_group!(benches, bench_analyze, bench_emit);
criterion_main!(benches);
