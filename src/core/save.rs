//! Save-script emit and restore
//!
//! The persisted-state layout: a `*tablename` header, `:chain policy
//! [packets:bytes]` chain declarations, legacy-syntax rule lines, and a
//! terminating `COMMIT`. Comment lines begin with `#`. Emitted output is
//! byte-stable so save → restore → save round-trips identically.
//!
//! Restore stages each table block into one batch and commits it at the
//! block's `COMMIT` line, so a partially-invalid script leaves the ruleset
//! untouched. Rule lines are tokenized with a [`logos`] lexer.

use crate::core::channel::{MsgBody, Placement};
use crate::core::error::{Error, Result};
use crate::core::repo;
use crate::core::rule::{
    Counters, Interface, MatchExt, RuleState, Target, builtin_hook, inv, proto_from_name,
    proto_to_name,
};
use crate::core::expr::Verdict;
use crate::core::session::Session;
use logos::Logos;
use std::fmt::Write;
use std::str::FromStr;
use tracing::info;

/// Emits the save script for one table, or for every table
pub fn save(h: &mut Session, table: Option<&str>, counters: bool) -> Result<String> {
    let tables: Vec<String> = match table {
        Some(name) => {
            if !repo::table_find(h, name)? {
                return Err(Error::NoSuchTable(name.to_string()));
            }
            vec![name.to_string()]
        }
        None => repo::table_list(h)?.into_iter().map(|t| t.name).collect(),
    };
    let mut out = String::new();
    for name in tables {
        let _ = writeln!(out, "*{name}");
        out.push_str(&repo::chain_save(h, &name, counters)?);
        out.push_str(&repo::rule_save(h, &name, counters)?);
        let _ = writeln!(out, "COMMIT");
    }
    Ok(out)
}

/// Re-ingests a save script, committing one batch per table block
pub fn restore(h: &mut Session, script: &str) -> Result<()> {
    let mut table: Option<String> = None;
    for (lineno, raw) in script.lines().enumerate() {
        let lineno = lineno + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('*') {
            table = Some(name.to_string());
            repo::table_add(h, name)?;
            continue;
        }
        let Some(table_name) = table.clone() else {
            return Err(Error::Restore {
                line: lineno,
                message: "content before any *table header".to_string(),
            });
        };
        if line == "COMMIT" {
            h.commit()?;
            info!(table = table_name, "table block restored");
            table = None;
            continue;
        }
        if let Some(decl) = line.strip_prefix(':') {
            restore_chain_decl(h, &table_name, decl, lineno)?;
            continue;
        }
        let (chain, cs) = parse_rule_line(line, lineno)?;
        repo::rule_add(h, &table_name, &chain, &cs, Placement::Append)?;
    }
    if let Some(name) = table {
        return Err(Error::Restore {
            line: script.lines().count(),
            message: format!("table `{name}` not terminated by COMMIT"),
        });
    }
    Ok(())
}

/// `:name policy [packets:bytes]`: base chains recover their hook from the
/// well-known (table, chain) pairs; `-` declares a user chain. Re-declared
/// chains are flushed so the script replaces their contents.
fn restore_chain_decl(h: &mut Session, table: &str, decl: &str, lineno: usize) -> Result<()> {
    let mut parts = decl.split_whitespace();
    let (Some(name), Some(policy)) = (parts.next(), parts.next()) else {
        return Err(Error::Restore {
            line: lineno,
            message: "chain declaration needs a name and a policy".to_string(),
        });
    };
    let counters = match parts.next() {
        Some(pair) => Some(parse_counter_pair(pair, lineno)?),
        None => None,
    };

    let (hook, policy) = if policy == "-" {
        (None, None)
    } else {
        let verdict = Verdict::from_str(policy).map_err(|_| Error::Restore {
            line: lineno,
            message: format!("unknown policy `{policy}`"),
        })?;
        let hook = builtin_hook(table, name).ok_or_else(|| Error::Restore {
            line: lineno,
            message: format!("`{name}` is not a base chain of table `{table}`"),
        })?;
        (Some(hook), Some(verdict))
    };
    h.stage(MsgBody::AddChain {
        table: table.to_string(),
        chain: name.to_string(),
        hook,
        policy,
        counters,
    })?;
    h.stage(MsgBody::FlushChain {
        table: table.to_string(),
        chain: name.to_string(),
    })?;
    Ok(())
}

fn parse_counter_pair(pair: &str, lineno: usize) -> Result<Counters> {
    let invalid = || Error::Restore {
        line: lineno,
        message: format!("malformed counter pair `{pair}`"),
    };
    let inner = pair
        .strip_prefix('[')
        .and_then(|p| p.strip_suffix(']'))
        .ok_or_else(invalid)?;
    let (packets, bytes) = inner.split_once(':').ok_or_else(invalid)?;
    Ok(Counters::new(
        packets.parse().map_err(|_| invalid())?,
        bytes.parse().map_err(|_| invalid())?,
    ))
}

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t]+")]
enum Token {
    #[token("!")]
    Bang,
    #[regex(r"\[[0-9]+:[0-9]+\]")]
    CounterPair,
    #[regex(r"-[A-Za-z]")]
    ShortOpt,
    #[regex(r"--[A-Za-z0-9][A-Za-z0-9-]*")]
    LongOpt,
    #[regex(r#""[^"]*""#)]
    Quoted,
    #[regex(r"[^ \t!\[-][^ \t]*")]
    Word,
}

fn tokenize(line: &str, lineno: usize) -> Result<Vec<(Token, String)>> {
    let mut lex = Token::lexer(line);
    let mut tokens = Vec::new();
    while let Some(token) = lex.next() {
        let token = token.map_err(|()| Error::Restore {
            line: lineno,
            message: format!("unrecognized token at `{}`", lex.slice()),
        })?;
        let text = match token {
            Token::Quoted => lex.slice().trim_matches('"').to_string(),
            _ => lex.slice().to_string(),
        };
        tokens.push((token, text));
    }
    Ok(tokens)
}

/// Parses a full save-script rule line (`[p:b] -A chain matches... target`)
pub fn parse_rule_line(line: &str, lineno: usize) -> Result<(String, RuleState)> {
    let tokens = tokenize(line, lineno)?;
    let mut chain = None;
    let cs = parse_tokens(&tokens, Some(&mut chain), lineno)?;
    let chain = chain.ok_or_else(|| Error::Restore {
        line: lineno,
        message: "rule line without -A".to_string(),
    })?;
    Ok((chain, cs))
}

/// Parses a rule specification without the `-A chain` part, as the CLI
/// passes it
pub fn parse_rule_spec(spec: &[String], lineno: usize) -> Result<RuleState> {
    let tokens = tokenize(&spec.join(" "), lineno)?;
    parse_tokens(&tokens, None, lineno)
}

fn parse_tokens(
    tokens: &[(Token, String)],
    mut chain: Option<&mut Option<String>>,
    lineno: usize,
) -> Result<RuleState> {
    let err = |message: String| Error::Restore {
        line: lineno,
        message,
    };
    let mut cs = RuleState::default();
    let mut invert = false;
    let mut i = 0;

    let expect_word = |tokens: &[(Token, String)], i: usize, what: &str| -> Result<String> {
        match tokens.get(i) {
            Some((Token::Word | Token::Quoted, text)) => Ok(text.clone()),
            _ => Err(Error::Restore {
                line: lineno,
                message: format!("expected {what}"),
            }),
        }
    };

    while i < tokens.len() {
        let (token, text) = &tokens[i];
        match token {
            Token::Bang => {
                invert = true;
                i += 1;
            }
            Token::CounterPair => {
                cs.counters = parse_counter_pair(text, lineno)?;
                i += 1;
            }
            Token::ShortOpt => {
                let taken_invert = std::mem::take(&mut invert);
                let inv_bit = |bit: u8, cs: &mut RuleState| {
                    if taken_invert {
                        cs.invflags |= bit;
                    }
                };
                match text.as_str() {
                    "-A" => {
                        let name = expect_word(tokens, i + 1, "a chain name after -A")?;
                        match chain.as_mut() {
                            Some(slot) => **slot = Some(name),
                            None => return Err(err("-A is not valid here".to_string())),
                        }
                        i += 2;
                    }
                    "-p" => {
                        let name = expect_word(tokens, i + 1, "a protocol after -p")?;
                        cs.protocol = proto_from_name(&name)
                            .ok_or_else(|| err(format!("unknown protocol `{name}`")))?;
                        inv_bit(inv::PROTO, &mut cs);
                        i += 2;
                    }
                    "-s" | "-d" => {
                        let addr = expect_word(tokens, i + 1, "an address")?;
                        let net = addr
                            .parse()
                            .map_err(|_| err(format!("invalid network `{addr}`")))?;
                        if *text == "-s" {
                            cs.src = Some(net);
                            inv_bit(inv::SRC, &mut cs);
                        } else {
                            cs.dst = Some(net);
                            inv_bit(inv::DST, &mut cs);
                        }
                        i += 2;
                    }
                    "-i" | "-o" => {
                        let name = expect_word(tokens, i + 1, "an interface name")?;
                        crate::validators::validate_interface(&name).map_err(&err)?;
                        let iface = Interface::parse(&name);
                        if *text == "-i" {
                            cs.iface_in = Some(iface);
                            inv_bit(inv::VIA_IN, &mut cs);
                        } else {
                            cs.iface_out = Some(iface);
                            inv_bit(inv::VIA_OUT, &mut cs);
                        }
                        i += 2;
                    }
                    "-m" => {
                        let name = expect_word(tokens, i + 1, "a match name after -m")?;
                        cs.matches.push(MatchExt {
                            name,
                            args: Vec::new(),
                        });
                        i += 2;
                    }
                    "-c" => {
                        let packets = expect_word(tokens, i + 1, "a packet count after -c")?;
                        let bytes = expect_word(tokens, i + 2, "a byte count after -c")?;
                        cs.counters = Counters::new(
                            packets.parse().map_err(|_| err("bad packet count".into()))?,
                            bytes.parse().map_err(|_| err("bad byte count".into()))?,
                        );
                        i += 3;
                    }
                    "-j" | "-g" => {
                        let name = expect_word(tokens, i + 1, "a target name")?;
                        let mut args = Vec::new();
                        i += 2;
                        while let Some((Token::LongOpt | Token::Word | Token::Quoted, text)) =
                            tokens.get(i)
                        {
                            args.push(text.clone());
                            i += 1;
                        }
                        cs.target = Some(if *text == "-g" {
                            Target::Goto(name)
                        } else {
                            Target::from_name(&name, args)
                        });
                    }
                    other => return Err(err(format!("unknown option `{other}`"))),
                }
            }
            Token::LongOpt => {
                // Option of the current match extension; without an explicit
                // -m the protocol's own extension is implied
                if cs.matches.is_empty() {
                    let Some(name) = proto_to_name(cs.protocol) else {
                        return Err(err(format!("`{text}` without a match extension")));
                    };
                    cs.matches.push(MatchExt {
                        name: name.to_string(),
                        args: Vec::new(),
                    });
                }
                let current = cs.matches.len() - 1;
                if invert {
                    cs.matches[current].args.push("!".to_string());
                    invert = false;
                }
                cs.matches[current].args.push(text.clone());
                i += 1;
                while let Some((Token::Word | Token::Quoted, value)) = tokens.get(i) {
                    cs.matches[current].args.push(value.clone());
                    i += 1;
                }
            }
            Token::Word | Token::Quoted => {
                return Err(err(format!("stray argument `{text}`")));
            }
        }
    }
    Ok(cs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::Verdict;

    #[test]
    fn test_parse_scenario_rule_line() {
        let (chain, cs) =
            parse_rule_line("-A INPUT -p tcp --dport 22 -j ACCEPT", 1).unwrap();
        assert_eq!(chain, "INPUT");
        assert_eq!(cs.protocol, 6);
        assert_eq!(cs.matches.len(), 1);
        assert_eq!(cs.matches[0].name, "tcp");
        assert_eq!(cs.matches[0].args, vec!["--dport", "22"]);
        assert_eq!(cs.target, Some(Target::Standard(Verdict::Accept)));
    }

    #[test]
    fn test_parse_inversion_and_interfaces() {
        let (_, cs) =
            parse_rule_line("-A INPUT ! -s 10.0.0.0/8 -i eth+ ! -o lo -j DROP", 1).unwrap();
        assert_eq!(cs.invflags, inv::SRC | inv::VIA_OUT);
        assert_eq!(cs.iface_in, Some(Interface::wildcard("eth")));
        assert_eq!(cs.iface_out, Some(Interface::exact("lo")));
    }

    #[test]
    fn test_parse_counter_prefix() {
        let (_, cs) =
            parse_rule_line("[12:3456] -A INPUT -p udp -j DROP", 1).unwrap();
        assert_eq!(cs.counters, Counters::new(12, 3456));
    }

    #[test]
    fn test_parse_explicit_match_and_target_args() {
        let (_, cs) = parse_rule_line(
            "-A INPUT -p tcp -m conntrack --ctstate NEW -j LOG --log-prefix \"probe: \"",
            1,
        )
        .unwrap();
        assert_eq!(cs.matches[0].name, "conntrack");
        assert_eq!(cs.matches[0].args, vec!["--ctstate", "NEW"]);
        assert_eq!(
            cs.target,
            Some(Target::Extension {
                name: "LOG".to_string(),
                args: vec!["--log-prefix".to_string(), "probe: ".to_string()],
            })
        );
    }

    #[test]
    fn test_parse_goto_target() {
        let (_, cs) = parse_rule_line("-A FORWARD -g web", 1).unwrap();
        assert_eq!(cs.target, Some(Target::Goto("web".to_string())));
    }

    #[test]
    fn test_rule_line_without_chain_rejected() {
        assert!(matches!(
            parse_rule_line("-p tcp -j ACCEPT", 3),
            Err(Error::Restore { line: 3, .. })
        ));
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(parse_rule_line("-A INPUT -z foo", 1).is_err());
    }

    #[test]
    fn test_spec_rejects_chain_option() {
        let spec: Vec<String> = ["-A", "INPUT"].iter().map(|s| s.to_string()).collect();
        assert!(parse_rule_spec(&spec, 1).is_err());
    }
}
