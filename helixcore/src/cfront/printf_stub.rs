//! The self-contained `printf` runtime. Appended once to
//! `.text` by codegen; calls lower to `call __printf` with `%rdi` = format
//! pointer and `%rsi` = the lone integer argument.
//!
//! Only `%d` is supported: the `%` and the byte after it are consumed
//! together, and dropped silently unless that byte is `d`. Literal bytes
//! are written one `write(1, ...)` syscall each, straight out of the
//! format string; a `%d` run is formatted into a stack buffer and flushed
//! with a single `write` covering the whole (optionally signed) digit run.
pub const PRINTF_STUB: &str = r#"
__printf:
    pushq %rbp
    movq %rsp, %rbp
    subq $16, %rsp
    movq %rdi, -8(%rbp)    # format cursor
    movq %rsi, -16(%rbp)   # the one integer argument
.L.printf.loop:
    movq -8(%rbp), %rax
    movzbq (%rax), %rax
    testq %rax, %rax
    je .L.printf.done
    cmpq $37, %rax         # '%'
    je .L.printf.conv
    movq -8(%rbp), %rsi
    movq $1, %rdx
    movq $1, %rdi
    movq $1, %rax
    syscall
    incq -8(%rbp)
    jmp .L.printf.loop
.L.printf.conv:
    incq -8(%rbp)
    movq -8(%rbp), %rax
    movzbq (%rax), %rax
    incq -8(%rbp)
    cmpq $100, %rax        # 'd'
    jne .L.printf.loop
    movq -16(%rbp), %rdi
    call __printf_fmt_i64
    jmp .L.printf.loop
.L.printf.done:
    movq %rbp, %rsp
    popq %rbp
    movq $0, %rax
    ret

# Formats %rdi as base-10 ASCII into a stack buffer, right-aligned, then
# writes the whole run in one syscall. Leading '-' for negative values.
__printf_fmt_i64:
    pushq %rbp
    movq %rsp, %rbp
    subq $48, %rsp
    movq %rdi, -8(%rbp)    # remaining value, becomes non-negative below
    movq $0, -16(%rbp)     # 1 if the original value was negative
    movq $24, -24(%rbp)    # free count: bytes of the 24-byte buffer still unused
    movq -8(%rbp), %rax
    testq %rax, %rax
    jns .L.fmt.loop
    movq $1, -16(%rbp)
    negq -8(%rbp)
.L.fmt.loop:
    movq -8(%rbp), %rax
    movq $0, %rdx
    movq $10, %rcx
    idivq %rcx
    movq %rax, -8(%rbp)
    addq $48, %rdx          # '0' + remainder
    decq -24(%rbp)
    leaq -40(%rbp), %rax
    movq -24(%rbp), %rbx
    addq %rbx, %rax
    movb %dl, (%rax)
    movq -8(%rbp), %rax
    testq %rax, %rax
    jne .L.fmt.loop
    cmpq $0, -16(%rbp)
    je .L.fmt.nosign
    decq -24(%rbp)
    leaq -40(%rbp), %rax
    movq -24(%rbp), %rbx
    addq %rbx, %rax
    movq $45, %rdx          # '-'
    movb %dl, (%rax)
.L.fmt.nosign:
    leaq -40(%rbp), %rsi
    movq -24(%rbp), %rbx
    addq %rbx, %rsi
    movq $24, %rdx
    subq -24(%rbp), %rdx
    movq $1, %rdi
    movq $1, %rax
    syscall
    movq %rbp, %rsp
    popq %rbp
    movq $0, %rax
    ret
"#;
