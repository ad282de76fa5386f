#[cfg(test)]
mod tests {
    /// Shipped opcode table. Any change here breaks previously assembled
    /// programs, so update it only together with the artifact version.
    const EXPECTED_ISA: &[&str] = &[
        "0x01 iadd Stack",
        "0x02 isub Stack",
        "0x03 imul Stack",
        "0x04 idiv Stack",
        "0x05 ilt Stack",
        "0x06 ile Stack",
        "0x07 igt Stack",
        "0x08 ige Stack",
        "0x09 ieq Stack",
        "0x0A ine Stack",
        "0x0B ineg Stack",
        "0x0C inot Stack",
        "0x0D iand Stack",
        "0x0E ior Stack",
        "0x0F ixor Stack",
        "0x10 fadd Stack",
        "0x11 fsub Stack",
        "0x12 fmul Stack",
        "0x13 flt Stack",
        "0x14 feq Stack",
        "0x15 itof Stack",
        "0x16 call Stack Func Jump",
        "0x17 ret Stack Jump",
        "0x18 br Stack Int Jump",
        "0x19 brt Stack Int Jump",
        "0x1A brf Stack Int Jump",
        "0x1B cconst Stack Int",
        "0x1C iconst Stack Int",
        "0x1D fconst Stack Pool",
        "0x1E sconst Stack Pool",
        "0x1F load Stack Int",
        "0x20 gload Stack Int",
        "0x21 fload Stack Int",
        "0x22 store Stack Int",
        "0x23 gstore Stack Int",
        "0x24 fstore Stack Int",
        "0x25 print Stack",
        "0x26 struct Stack Int",
        "0x27 null Stack",
        "0x28 pop Stack",
        "0x29 halt Stack",
        "0x2A imod Stack",
        "0x2B fdiv Stack",
        "0x2C dup Stack",
        "0x2D nop Stack",
        "0x60 mov Register Reg Reg",
        "0x61 li Register Reg Imm",
        "0x62 lw Register Reg Reg Imm",
        "0x63 sw Register Reg Reg Imm",
        "0x64 add Register Reg Reg Reg",
        "0x65 sub Register Reg Reg Reg",
        "0x66 mul Register Reg Reg Reg",
        "0x67 div Register Reg Reg Reg",
        "0x68 slt Register Reg Reg Reg",
        "0x69 sle Register Reg Reg Reg",
        "0x6A sgt Register Reg Reg Reg",
        "0x6B sge Register Reg Reg Reg",
        "0x6C seq Register Reg Reg Reg",
        "0x6D sne Register Reg Reg Reg",
        "0x6E jf Register Reg Imm Jump",
    ];

    macro_rules! describe_isa {
        (
            $( $(#[$doc:meta])* $name:ident = $opcode:expr, $mnemonic:literal => $layout:ident [
                $( $field:ident : $kind:ident ),* $(,)?
            ], $flow:ident ),* $(,)?
        ) => {{
            let mut lines: Vec<String> = Vec::new();
            $(
                assert_eq!(crate::virtual_machine::isa::Instruction::$name as u8, $opcode);
                let mut line = format!(
                    "0x{:02X} {} {}",
                    crate::virtual_machine::isa::Instruction::$name as u8,
                    $mnemonic,
                    stringify!($layout)
                );
                $( line.push(' '); line.push_str(stringify!($kind)); )*
                if stringify!($flow) == "Jump" {
                    line.push_str(" Jump");
                }
                lines.push(line);
            )*
            lines
        }};
    }

    fn current_isa() -> Vec<String> {
        crate::for_each_instruction!(describe_isa)
    }

    #[test]
    #[ignore]
    fn print_isa() {
        for line in current_isa() {
            println!("\"{line}\",");
        }
    }

    #[test]
    fn isa_unchanged() {
        assert_eq!(current_isa(), EXPECTED_ISA);
    }
}
