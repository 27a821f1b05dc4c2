use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{Ast, Builtin, FunId, Node, XIndex};
use crate::compiler::{FRAME_WORDS, LINKAGE_WORDS};
use crate::lexer::Range;

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("undefined variable `{name}`")]
    Undefined { name: String },
    #[error("undefined function `{name}`")]
    UndefinedFunction { name: String },
    #[error("function `{name}` is already defined")]
    DuplicateFunction { name: String },
    #[error("`{name}` takes {expected} argument(s), got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("`{name}` declares {count} locals, more than a frame holds")]
    FrameOverflow { name: String, count: usize },
}

/// Walks the parsed tree, turning identifier references into frame slots
/// and call sites into function ids. Functions are collected in a
/// forward-declaring pre-pass so call order does not matter.
pub fn resolve(ast: &mut Ast, src: &str) -> Result<(), ResolveError> {
    let resolver = Resolver {
        ast,
        src: src.as_bytes(),
        funs: HashMap::new(),
        fun_arity: Vec::new(),
        scope: Scope::new(),
    };
    return resolver.run();
}

struct Resolver<'a> {
    ast: &'a mut Ast,
    src: &'a [u8],
    funs: HashMap<&'a str, FunId>,
    /// fun id -> parameter count, in declaration order
    fun_arity: Vec<usize>,
    scope: Scope<'a>,
}

impl<'a> Resolver<'a> {
    fn run(mut self) -> Result<(), ResolveError> {
        let top: Vec<u32> = self.ast.extra.slice(self.ast.top).to_vec();

        for &item in &top {
            let Node::FunDef { name, params, .. } = self.ast.nodes[item as usize] else {
                continue;
            };
            let text = self.text(name);
            let id = self.fun_arity.len() as FunId;
            if self.funs.insert(text, id).is_some() {
                return Err(ResolveError::DuplicateFunction {
                    name: text.to_string(),
                });
            }
            self.fun_arity.push(self.ast.extra.len_of(params));
        }

        // each function body gets an isolated scope
        for &item in &top {
            let Node::FunDef {
                name, params, body, ..
            } = self.ast.nodes[item as usize]
            else {
                continue;
            };
            self.scope.reset();
            self.bind_params(params);
            self.resolve_block(body)?;
            self.check_frame(self.text(name))?;
        }

        // top-level statements share one entry scope
        self.scope.reset();
        for &item in &top {
            if matches!(self.ast.nodes[item as usize], Node::FunDef { .. }) {
                continue;
            }
            self.resolve_node(item as usize)?;
        }
        self.check_frame("<toplevel>")?;

        Ok(())
    }

    fn text(&self, range: Range) -> &'a str {
        return std::str::from_utf8(&self.src[range.0..range.1]).unwrap();
    }

    fn bind_params(&mut self, params: XIndex) {
        let n = self.ast.extra.len_of(params);
        for i in 0..n {
            let p = self.ast.extra.get(params, i) as usize;
            let Node::Ident(range) = self.ast.nodes[p] else {
                unreachable!("parameter list holds identifier nodes");
            };
            let name = self.text(range);
            // i-th of n parameters sits below the linkage words
            let offset = i as i64 - n as i64 - LINKAGE_WORDS;
            self.scope.bind(name, offset);
        }
    }

    fn check_frame(&self, name: &str) -> Result<(), ResolveError> {
        let count = self.scope.n_locals();
        if count > FRAME_WORDS as usize {
            return Err(ResolveError::FrameOverflow {
                name: name.to_string(),
                count,
            });
        }
        Ok(())
    }

    fn resolve_block(&mut self, block: XIndex) -> Result<(), ResolveError> {
        let n = self.ast.extra.len_of(block);
        for i in 0..n {
            let stmt = self.ast.extra.get(block, i) as usize;
            self.resolve_node(stmt)?;
        }
        Ok(())
    }

    fn resolve_node(&mut self, n: usize) -> Result<(), ResolveError> {
        let node = self.ast.nodes[n];
        match node {
            Node::Int(_) | Node::Local { .. } | Node::Continue { .. } => Ok(()),
            Node::Ident(range) => {
                let name = self.text(range);
                let Some(offset) = self.scope.get(name) else {
                    return Err(ResolveError::Undefined {
                        name: name.to_string(),
                    });
                };
                self.ast.nodes[n] = Node::Local { offset };
                Ok(())
            }
            Node::Unary { operand, .. } => self.resolve_node(operand),
            Node::Binop { lhs, rhs, .. } => {
                self.resolve_node(lhs)?;
                self.resolve_node(rhs)
            }
            Node::Deref { addr } => self.resolve_node(addr),
            Node::AddrOf { target } => self.resolve_node(target),
            Node::Assign { target, value } => {
                // value first: `&x = x` with a fresh x is an undefined-variable
                // error, not a read of whatever the slot held
                self.resolve_node(value)?;
                match self.ast.nodes[target] {
                    Node::AddrOf { target: ident } => {
                        let Node::Ident(range) = self.ast.nodes[ident] else {
                            unreachable!("`&` applies to identifiers");
                        };
                        let name = self.text(range);
                        let offset = match self.scope.get(name) {
                            Some(offset) => offset,
                            // first use as an assignment target declares the variable
                            None => self.scope.declare_local(name),
                        };
                        self.ast.nodes[ident] = Node::Local { offset };
                        Ok(())
                    }
                    Node::Deref { .. } => self.resolve_node(target),
                    _ => unreachable!("parser enforces assignment targets"),
                }
            }
            Node::Call { name, args } => {
                let n_args = self.ast.extra.len_of(args);
                for i in 0..n_args {
                    let arg = self.ast.extra.get(args, i) as usize;
                    self.resolve_node(arg)?;
                }
                let text = self.text(name);
                if let Some(which) = Builtin::from_name(text) {
                    if n_args != which.arity() {
                        return Err(ResolveError::ArityMismatch {
                            name: text.to_string(),
                            expected: which.arity(),
                            got: n_args,
                        });
                    }
                    self.ast.nodes[n] = Node::CallBuiltin { which, args };
                    return Ok(());
                }
                let Some(&fun) = self.funs.get(text) else {
                    return Err(ResolveError::UndefinedFunction {
                        name: text.to_string(),
                    });
                };
                let expected = self.fun_arity[fun as usize];
                if n_args != expected {
                    return Err(ResolveError::ArityMismatch {
                        name: text.to_string(),
                        expected,
                        got: n_args,
                    });
                }
                self.ast.nodes[n] = Node::CallFun { fun, args };
                Ok(())
            }
            Node::If {
                cond,
                then_blk,
                else_blk,
                ..
            } => {
                self.resolve_node(cond)?;
                self.resolve_block(then_blk)?;
                self.resolve_block(else_blk)
            }
            Node::Loop { body, .. } => self.resolve_block(body),
            Node::Break { value, .. } => self.resolve_node(value),
            Node::Return { value } => match value {
                Some(v) => self.resolve_node(v),
                None => Ok(()),
            },
            Node::FunDef { .. } => unreachable!("functions only appear at the top level"),
            Node::CallFun { .. } | Node::CallBuiltin { .. } => {
                unreachable!("node resolved twice")
            }
        }
    }
}

/// One function's variables. Parameters carry negative offsets, locals
/// get the next non-negative slot in first-assignment order; slots are
/// never reused by another name.
struct Scope<'s> {
    names: Vec<&'s str>,
    offsets: Vec<i64>,
    next_local: i64,
}

impl<'s> Scope<'s> {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            offsets: Vec::new(),
            next_local: 0,
        }
    }

    fn reset(&mut self) {
        self.names.clear();
        self.offsets.clear();
        self.next_local = 0;
    }

    fn bind(&mut self, name: &'s str, offset: i64) {
        self.names.push(name);
        self.offsets.push(offset);
    }

    fn declare_local(&mut self, name: &'s str) -> i64 {
        let offset = self.next_local;
        self.next_local += 1;
        self.bind(name, offset);
        return offset;
    }

    fn get(&self, name: &str) -> Option<i64> {
        let pos = self.names.iter().rev().position(|&n| n == name)?;
        return Some(self.offsets[self.names.len() - pos - 1]);
    }

    fn n_locals(&self) -> usize {
        return self.next_local as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tests::{assert_matches, parse};

    fn resolved(contents: &str) -> Ast {
        let mut ast = parse(contents).expect("parse error");
        resolve(&mut ast, contents).expect("resolve error");
        return ast;
    }

    fn resolve_err(contents: &str) -> ResolveError {
        let mut ast = parse(contents).expect("parse error");
        return resolve(&mut ast, contents).unwrap_err();
    }

    fn top_nodes(ast: &Ast) -> Vec<Node> {
        ast.extra
            .slice(ast.top)
            .iter()
            .map(|&i| ast.nodes[i as usize])
            .collect()
    }

    #[test]
    fn locals_get_dense_slots() {
        let ast = resolved("&a = 1\n&b = 2\n&c = a + b");
        // third statement's target is the slot declared last
        let top = top_nodes(&ast);
        assert_matches!(top[2], Node::Assign { target, .. } => {
            assert_matches!(ast.nodes[target], Node::AddrOf { target: slot } => {
                assert_matches!(ast.nodes[slot], Node::Local { offset: 2 });
            });
        });
    }

    #[test]
    fn reference_resolves_to_declared_slot() {
        let ast = resolved("&a = 1\n&b = a");
        let top = top_nodes(&ast);
        assert_matches!(top[1], Node::Assign { value, .. } => {
            assert_matches!(ast.nodes[value], Node::Local { offset: 0 });
        });
    }

    #[test]
    fn reassignment_reuses_the_slot() {
        let ast = resolved("&a = 1\n&a = 2");
        let top = top_nodes(&ast);
        for node in &top {
            assert_matches!(node, Node::Assign { target, .. } => {
                assert_matches!(ast.nodes[*target], Node::AddrOf { target: slot } => {
                    assert_matches!(ast.nodes[slot], Node::Local { offset: 0 });
                });
            });
        }
    }

    #[test]
    fn params_get_negative_offsets() {
        let ast = resolved("fn f(a, b) { return a + b }");
        let top = top_nodes(&ast);
        assert_matches!(top[0], Node::FunDef { body, .. } => {
            let ret = ast.extra.get(body, 0) as usize;
            assert_matches!(ast.nodes[ret], Node::Return { value: Some(add) } => {
                assert_matches!(ast.nodes[add], Node::Binop { lhs, rhs, .. } => {
                    // first of two params: 0 - 2 - 3, second: 1 - 2 - 3
                    assert_matches!(ast.nodes[lhs], Node::Local { offset: -5 });
                    assert_matches!(ast.nodes[rhs], Node::Local { offset: -4 });
                });
            });
        });
    }

    #[test]
    fn undefined_variable() {
        let err = resolve_err("&a = b");
        assert_matches!(err, ResolveError::Undefined { .. });
    }

    #[test]
    fn fresh_variable_cannot_read_itself() {
        let err = resolve_err("&x = x + 1");
        assert_matches!(err, ResolveError::Undefined { .. });
    }

    #[test]
    fn undefined_function() {
        let err = resolve_err("f()");
        assert_matches!(err, ResolveError::UndefinedFunction { .. });
    }

    #[test]
    fn forward_reference_resolves() {
        let ast = resolved("fn a() { return b() }\nfn b() { return 1 }");
        let top = top_nodes(&ast);
        assert_matches!(top[0], Node::FunDef { body, .. } => {
            let ret = ast.extra.get(body, 0) as usize;
            assert_matches!(ast.nodes[ret], Node::Return { value: Some(call) } => {
                // `b` was declared second, so its id is 1
                assert_matches!(ast.nodes[call], Node::CallFun { fun: 1, .. });
            });
        });
    }

    #[test]
    fn duplicate_function() {
        let err = resolve_err("fn f() { return 1 }\nfn f() { return 2 }");
        assert_matches!(err, ResolveError::DuplicateFunction { .. });
    }

    #[test]
    fn call_arity_is_checked() {
        let err = resolve_err("fn f(a) { return a }\nf(1, 2)");
        assert_matches!(
            err,
            ResolveError::ArityMismatch {
                expected: 1,
                got: 2,
                ..
            }
        );
    }

    #[test]
    fn builtins_resolve_with_arity() {
        let ast = resolved("&x = 0\nusleep(0)\nwrite(1, &x, 8)");
        let top = top_nodes(&ast);
        assert_matches!(top[1], Node::CallBuiltin { which: Builtin::Usleep, .. });
        assert_matches!(top[2], Node::CallBuiltin { which: Builtin::Write, .. });
    }

    #[test]
    fn builtin_arity_is_checked() {
        let err = resolve_err("usleep(1, 2)");
        assert_matches!(
            err,
            ResolveError::ArityMismatch {
                expected: 1,
                got: 2,
                ..
            }
        );
    }

    #[test]
    fn scopes_are_isolated_per_function() {
        // the same name lands on slot 0 in both functions
        let ast = resolved("fn f() { &v = 1\n return v }\nfn g() { &v = 2\n return v }");
        for node in top_nodes(&ast) {
            assert_matches!(node, Node::FunDef { body, .. } => {
                let assign = ast.extra.get(body, 0) as usize;
                assert_matches!(ast.nodes[assign], Node::Assign { target, .. } => {
                    assert_matches!(ast.nodes[target], Node::AddrOf { target: slot } => {
                        assert_matches!(ast.nodes[slot], Node::Local { offset: 0 });
                    });
                });
            });
        }
    }

    #[test]
    fn frame_overflow_is_detected_early() {
        let mut src = String::new();
        for i in 0..300 {
            src.push_str(&format!("&v{} = {}\n", i, i));
        }
        let err = resolve_err(&src);
        assert_matches!(err, ResolveError::FrameOverflow { count: 300, .. });
    }

    #[test]
    fn function_scope_does_not_leak_to_toplevel() {
        let err = resolve_err("fn f() { &v = 1\n return v }\n&x = v");
        assert_matches!(err, ResolveError::Undefined { .. });
    }
}
