use std::fs;

use minimatlab::{compile, errors::TranslateError, translate};

fn program(name: &str) -> String {
    fs::read_to_string(format!("tests/mm_programs/good/{}", name)).unwrap()
}

#[test]
fn test_good() {
    let paths = fs::read_dir("tests/mm_programs/good").unwrap();

    for path in paths {
        let p = path.unwrap().path();
        println!("path is {}", p.display());
        let input = fs::read_to_string(&p).unwrap();
        let file = p.display().to_string();
        if let Err(e) = compile(&file, &input, false) {
            panic!("{} failed to compile: {}", file, e);
        }
    }
}

#[test]
fn test_bad() {
    let paths = fs::read_dir("tests/mm_programs/bad").unwrap();

    for path in paths {
        let p = path.unwrap().path();
        println!("path is {}", p.display());
        let input = fs::read_to_string(&p).unwrap();
        assert!(compile(&p.display().to_string(), &input, false).is_err());
    }
}

#[test]
fn test_bad_errors_are_specific() {
    let input = fs::read_to_string("tests/mm_programs/bad/syntax.mm").unwrap();
    assert!(matches!(translate("syntax.mm", &input, false), Err(TranslateError::Syntax(_))));

    let input = fs::read_to_string("tests/mm_programs/bad/undefined.mm").unwrap();
    assert!(matches!(
        translate("undefined.mm", &input, false),
        Err(TranslateError::UndefinedSymbol(ref n)) if n == "y"
    ));

    let input = fs::read_to_string("tests/mm_programs/bad/bad_index.mm").unwrap();
    match translate("bad_index.mm", &input, false) {
        Err(TranslateError::Semantic { line, msg, .. }) => {
            assert_eq!(3, line);
            assert!(msg.contains("out of range"), "{}", msg);
        }
        other => panic!("expected a semantic error, got {:?}", other.map(|_| ())),
    }

    let input = fs::read_to_string("tests/mm_programs/bad/too_large.mm").unwrap();
    match translate("too_large.mm", &input, false) {
        Err(TranslateError::Semantic { line, msg, .. }) => {
            assert_eq!(1, line);
            assert!(msg.contains("too large"), "{}", msg);
        }
        other => panic!("expected a semantic error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_every_jump_is_resolved() {
    let mic = translate("loops.mm", &program("loops.mm"), false).unwrap();
    let jumps = mic.quads.iter().filter(|q| q.op.is_jump()).count();
    assert!(jumps > 0);
    let asm = compile("loops.mm", &program("loops.mm"), false).unwrap();
    assert!(asm.contains("\t.globl\tsum"));
    assert!(asm.contains("\t.globl\tmain"));
    assert!(asm.contains("call\tsum"));
}

#[test]
fn test_many_arguments() {
    let asm = compile("many_args.mm", &program("many_args.mm"), false).unwrap();
    // the seventh integer argument goes on the stack and is popped after the call.
    assert!(asm.contains("pushq"));
    assert!(asm.contains("call\tadd7"));
    assert!(asm.contains("call\tmix"));
    assert!(asm.contains("%xmm"));
}

#[test]
fn test_matrix_program() {
    let asm = compile("matrices.mm", &program("matrices.mm"), false).unwrap();
    assert!(asm.contains("call\tmatMult"));
    assert!(asm.contains("call\tcalloc"));
    assert!(asm.contains("call\tfree"));
    assert!(asm.contains("call\tprintMatrix"));
}

#[test]
fn test_globals_program() {
    let asm = compile("globals.mm", &program("globals.mm"), false).unwrap();
    assert!(asm.contains("counter:\n\t.long\t3"));
    assert!(asm.contains("letter:\n\t.byte\t113"));
    assert!(asm.contains("\t.comm\tcursor,8,8"));
    assert!(asm.contains("G:\n\t.long\t2\n\t.long\t2\n"));
}

#[test]
fn test_strings_are_in_rodata() {
    let asm = compile("pointers.mm", &program("pointers.mm"), false).unwrap();
    assert!(asm.contains(".LS"));
    assert!(asm.contains("call\tprintStr"));
}

#[test]
fn test_emit_mic_dump() {
    let mic = translate("scalar_arith.mm", &program("scalar_arith.mm"), false).unwrap();
    let mut out = Vec::new();
    mic.emit_mic(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("Quads for scalar_arith.mm"));
    assert!(text.contains("gST"));
    assert!(text.contains("main"));
}
