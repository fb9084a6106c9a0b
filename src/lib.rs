//! Rolltable — weighted, stateful random-table engine for procedural
//! text generation.
//!
//! Expands indentation-structured tables of weighted choices into text,
//! tracking mutable state across the expansion, with numeric range rolls,
//! subtable calls, and uniqueness constraints. A second, independent
//! subsystem compiles ABNF-like rule grammars into nondeterministic state
//! machines with backtracking partial-match search.

pub mod automata;
pub mod core;
