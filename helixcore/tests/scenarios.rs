//! End-to-end scenarios: source text in, stdout bytes and exit code out,
//! driven against the mock emulator backend.

use std::cell::RefCell;
use std::rc::Rc;

use helixcore::adapter::Adapter;
use helixcore::emulator::mock::MockEmulator;
use helixcore::hostfs::FileStore;
use helixcore::orchestrator::{Language, Orchestrator};
use helixcore::RunResult;

struct Captured {
    stdout: Rc<RefCell<String>>,
    stderr: Rc<RefCell<String>>,
}

fn run(language: Language, source: &str) -> (RunResult, Captured) {
    let stdout = Rc::new(RefCell::new(String::new()));
    let stderr = Rc::new(RefCell::new(String::new()));
    let stdout_clone = stdout.clone();
    let stderr_clone = stderr.clone();
    let adapter = Adapter::new(
        FileStore::new(),
        move |s: &str| stdout_clone.borrow_mut().push_str(s),
        move |s: &str| stderr_clone.borrow_mut().push_str(s),
    );
    let mut orchestrator = Orchestrator::new(adapter);
    let result = orchestrator.run::<MockEmulator>(language, source).unwrap();
    (result, Captured { stdout, stderr })
}

#[test]
fn asm_hello_world() {
    let source = r#"
.data
msg: .ascii "Hello from HelixCore x86-64!\n"
.text
_start:
    movq $1, %rax
    movq $1, %rdi
    leaq msg(%rip), %rsi
    movq $29, %rdx
    syscall
    movq $60, %rax
    xorq %rdi, %rdi
    syscall
"#;
    let (result, out) = run(Language::Asm, source);
    assert_eq!(result.exit_code, 0);
    assert_eq!(*out.stdout.borrow(), "Hello from HelixCore x86-64!\n");
    assert_eq!(*out.stderr.borrow(), "");
}

#[test]
fn c_arithmetic() {
    let source = "int main(){int a=10;int b=20;int c=a+b*2;printf(\"%d\\n\",c);return 0;}";
    let (result, out) = run(Language::C, source);
    assert_eq!(result.exit_code, 0);
    assert_eq!(*out.stdout.borrow(), "50\n");
}

#[test]
fn c_branching() {
    let source = "int main(){int c=41;if(c>40)printf(\"y\\n\");else printf(\"n\\n\");return 0;}";
    let (result, out) = run(Language::C, source);
    assert_eq!(result.exit_code, 0);
    assert_eq!(*out.stdout.borrow(), "y\n");
}

#[test]
fn c_while_loop() {
    let source = "int main(){int i=0;while(i<3){printf(\"%d\\n\",i);i=i+1;}return 0;}";
    let (result, out) = run(Language::C, source);
    assert_eq!(result.exit_code, 0);
    assert_eq!(*out.stdout.borrow(), "0\n1\n2\n");
}

#[test]
fn printf_negative() {
    let source = "int main(){int x=0-7;printf(\"%d\\n\",x);return 0;}";
    let (result, out) = run(Language::C, source);
    assert_eq!(result.exit_code, 0);
    assert_eq!(*out.stdout.borrow(), "-7\n");
}

#[test]
fn non_zero_exit() {
    let source = "_start:\n    movq $60, %rax\n    movq $42, %rdi\n    syscall\n";
    let (result, out) = run(Language::Asm, source);
    assert_eq!(result.exit_code, 42);
    assert_eq!(*out.stdout.borrow(), "");
}

#[test]
fn c_and_asm_paths_agree_on_exit_and_stdout() {
    let c_source = "int main(){int a=3;int b=4;printf(\"%d\\n\",a+b);return 0;}";
    let (c_result, c_out) = run(Language::C, c_source);

    let assembly = helixcore::cfront::compile(c_source).unwrap().assembly;
    let (asm_result, asm_out) = run(Language::Asm, &assembly);

    assert_eq!(c_result.exit_code, asm_result.exit_code);
    assert_eq!(*c_out.stdout.borrow(), *asm_out.stdout.borrow());
}
