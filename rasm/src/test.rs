//! End-to-end scenarios from spec.md §8 "Testable properties".

use rvm::isa::RegisterId;
use rvm::vm::{ExecutionBackend, Vm};

use crate::{assemble, AsmError};

fn run(source: &str) -> rvm::VmExit {
    let program = assemble(source).unwrap();
    let mut vm = Vm::new(&program.image(), 1, program.prologue);
    vm.run(ExecutionBackend::Interpreter).unwrap()
}

#[test]
fn arithmetic_and_print() {
    let exit = run(
        "MOV R0, 40
         ADD R0, 2
         CALL sys_print_u64
         JMP sys_enter",
    );
    assert_eq!(exit.registers[RegisterId::R0.index()], 42);
}

#[test]
fn signed_comparison_takes_the_lt_branch() {
    let exit = run(
        "MOV R0, -1
         MOV R1, 1
         CMP R0, R1
         JMPLT ok
         MOV R2, 0xBAD
         JMP sys_enter
     ok:
         MOV R2, 1
         JMP sys_enter",
    );
    assert_eq!(exit.registers[RegisterId::R2.index()], 1);
    assert!(exit.flags.lt);
    assert!(!exit.flags.eq);
    assert!(!exit.flags.gt);
}

#[test]
fn local_labels_in_two_top_level_scopes_resolve_independently_and_order_by_address() {
    let program = assemble(
        "foo:
         MOV R0, 1
     .loop:
         JMPEQ .loop
         JMP bar
     bar:
         MOV R1, 2
     .loop:
         JMPEQ .loop
         RET",
    )
    .unwrap();

    let loop_labels: Vec<&str> = program
        .labels
        .iter()
        .filter(|(_, name)| name.ends_with(".loop"))
        .map(|(_, name)| name.as_str())
        .collect();
    assert_eq!(loop_labels, vec!["foo:.loop", "bar:.loop"]);
}

#[test]
fn memory_round_trip() {
    let exit = run(
        "MOV R0, 0x1000
         MOV R1, 0xDEADBEEF
         STORE [R0+8], R1
         LOAD R2, [R0+8]
         JMP sys_enter",
    );
    assert_eq!(exit.registers[RegisterId::R2.index()], 0xDEADBEEF);
}

#[test]
fn call_ret_leaves_the_callee_result_in_place() {
    let exit = run(
        "CALL f
         JMP sys_enter
     f:
         MOV R0, 7
         RET",
    );
    assert_eq!(exit.registers[RegisterId::R0.index()], 7);
}

#[test]
fn forward_jump_patch_is_byte_identical_to_backward_jump() {
    let forward = assemble(
        "JMP end
     end:
         RET",
    )
    .unwrap();
    let backward = assemble(
        "end:
         JMP end
         RET",
    )
    .unwrap();

    // Only the jump target differs in position relative to its own `JMP`, so
    // compare everything past the shared prologue instructions.
    let forward_tail = &forward.instructions[forward.instructions.len() - 2..];
    let backward_tail = &backward.instructions[backward.instructions.len() - 2..];
    assert_eq!(forward_tail[1], backward_tail[1]); // the `RET`
    // Both `JMP`s resolve to their own `end:`, i.e. to themselves plus the
    // instruction width, so the encoded target addresses match in shape.
    assert_eq!(forward_tail[0].len(), backward_tail[0].len());
}

#[test]
fn duplicate_top_level_label_is_rejected() {
    let err = assemble(
        "dup:
         RET
     dup:
         RET",
    )
    .unwrap_err();
    assert!(matches!(err, AsmError::DuplicateLabel { .. }));
}

#[test]
fn local_label_without_enclosing_top_level_label_is_rejected() {
    let err = assemble(
        ".loop:
         RET",
    )
    .unwrap_err();
    assert!(matches!(err, AsmError::OrphanLocalLabel { .. }));
}

#[test]
fn unknown_mnemonic_reports_its_line() {
    let err = assemble("BOGUS R0, 1").unwrap_err();
    match err {
        AsmError::UnknownMnemonic { line, mnemonic } => {
            assert_eq!(line, 1);
            assert_eq!(mnemonic, "BOGUS");
        }
        other => panic!("expected UnknownMnemonic, got {:?}", other),
    }
}
