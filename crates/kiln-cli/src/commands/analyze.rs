//! `kiln analyze`: Print the block graph and dataflow facts.

use std::path::Path;

use anyhow::Context;
use kiln_engine::bytecode::{decode, folded_oparg, validate};
use kiln_engine::jit::analysis::analyze;

pub fn execute(path: &Path) -> anyhow::Result<()> {
    let unit = super::load_unit(path)?;
    let instrs = decode(&unit.code).context("Failed to decode instructions")?;
    validate(&unit, &instrs).context("Unit is malformed")?;
    let analysis = analyze(&unit, &instrs).context("Analysis failed")?;

    println!(
        "{} ({}:{}) instructions={} locals={} args={} stack={}",
        unit.name,
        unit.filename,
        unit.first_line,
        instrs.len(),
        unit.nlocals,
        unit.nargs(),
        unit.stacksize
    );
    println!();
    for (vpc, instr) in instrs.iter().enumerate() {
        let marker = if analysis.redundant_loads.get(vpc) { "*" } else { " " };
        if instr.opcode.has_argument() {
            println!("{}{:>5} {:<24} {}", marker, vpc, instr.opcode.name(), folded_oparg(&instrs, vpc));
        } else {
            println!("{}{:>5} {}", marker, vpc, instr.opcode.name());
        }
    }
    println!();
    print!("{}", analysis);
    Ok(())
}
