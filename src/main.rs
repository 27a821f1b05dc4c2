mod ast;
mod compiler;
mod lexer;
mod parser;
mod resolve;
mod rt;

use anyhow::{Context, Result};

use compiler::Compiler;
use lexer::Lexer;
use parser::Parser;
use rt::Vm;

const DEFAULT_SOURCE: &str = "main.rill";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let dump_tokens = args.iter().any(|a| a == "--tokens");
    let dump_bc = args.iter().any(|a| a == "--bc");
    let path = args
        .iter()
        .find(|a| !a.starts_with('-'))
        .map(String::as_str)
        .unwrap_or(DEFAULT_SOURCE);

    let source =
        std::fs::read_to_string(path).with_context(|| format!("cannot read `{}`", path))?;

    let tokens = Lexer::new(&source)
        .tokenize()
        .with_context(|| format!("{}: lex error", path))?;
    if dump_tokens {
        for spanned in &tokens {
            println!("{:>5}: {:?}", spanned.at, spanned.tok);
        }
        return Ok(());
    }

    let mut ast = Parser::new(&source, tokens)
        .parse()
        .with_context(|| format!("{}: parse error", path))?;
    resolve::resolve(&mut ast, &source).with_context(|| format!("{}: resolve error", path))?;
    let program = Compiler::compile(&ast).with_context(|| format!("{}: link error", path))?;

    if dump_bc {
        print!("{}", compiler::disasm::disasm(&program));
    }

    let mut vm = Vm::new(program);
    let value = vm.run().with_context(|| format!("{}: runtime fault", path))?;
    println!("{}", value);
    Ok(())
}
