//! Decoder for `iptables-save` text and encoder for structured rules.
//!
//! The decoder is deliberately tolerant: it never fails on unknown input.
//! Unrecognized tables are skipped wholesale, unknown rule options stay in
//! the verbatim `spec`, and a rule that appears before its chain header
//! auto-creates the chain (some dumps in the wild are malformed that way).

use super::{Chain, FirewallDump, Rule, RuleInput, Table, TableDump};

/// Decode a full `iptables-save` dump.
///
/// Blank lines and `#` comments are skipped. Table order and per-table
/// chain order follow the input; known tables absent from the dump are
/// appended empty at the end.
pub fn decode(dump: &str) -> FirewallDump {
    let mut out = FirewallDump::default();
    let mut current: Option<usize> = None;

    for line in dump.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('*') {
            // Unknown tables leave `current` unset and their body is dropped.
            current = name.trim().parse::<Table>().ok().map(|table| {
                if let Some(pos) = out.tables.iter().position(|t| t.table == table) {
                    pos
                } else {
                    out.tables.push(TableDump {
                        table,
                        chains: Vec::new(),
                    });
                    out.tables.len() - 1
                }
            });
            continue;
        }
        if line == "COMMIT" {
            current = None;
            continue;
        }
        let Some(table_idx) = current else {
            continue;
        };

        if let Some(rest) = line.strip_prefix(':') {
            let mut parts = rest.split_whitespace();
            let Some(name) = parts.next() else { continue };
            let policy = parts.next().unwrap_or("-").to_string();
            let counters = parts
                .next()
                .filter(|tok| tok.starts_with('['))
                .unwrap_or("")
                .to_string();
            let builtin = policy != "-";
            out.tables[table_idx].chains.push(Chain {
                name: name.to_string(),
                policy,
                counters,
                builtin,
                rules: Vec::new(),
            });
            continue;
        }

        if let Some(rest) = line.strip_prefix("-A ") {
            let rest = rest.trim();
            let Some(chain_name) = rest.split_whitespace().next() else {
                continue;
            };
            let spec = rest[chain_name.len()..].trim().to_string();
            let table_name = out.tables[table_idx].table.as_str().to_string();

            let chains = &mut out.tables[table_idx].chains;
            let chain_idx = match chains.iter().position(|c| c.name == chain_name) {
                Some(idx) => idx,
                None => {
                    // Rule before its chain header: auto-create the chain.
                    chains.push(Chain {
                        name: chain_name.to_string(),
                        policy: "-".to_string(),
                        counters: String::new(),
                        builtin: false,
                        rules: Vec::new(),
                    });
                    chains.len() - 1
                }
            };

            let num = chains[chain_idx].rules.len() as u32 + 1;
            let mut rule = Rule {
                id: format!("{chain_name}:{num}"),
                num,
                chain: chain_name.to_string(),
                table: table_name,
                comment: parse_comment(&spec),
                spec: spec.clone(),
                ..Default::default()
            };
            project_spec(&mut rule, &spec);
            chains[chain_idx].rules.push(rule);
        }
        // Anything else (e.g. counter lines from `iptables-save -c`) is ignored.
    }

    for table in Table::ALL {
        if out.table(table).is_none() {
            out.tables.push(TableDump {
                table,
                chains: Vec::new(),
            });
        }
    }
    out
}

/// Decode one table out of a dump: its chains plus the flattened rule list.
pub fn parse_table(dump: &str, table: Table) -> (Vec<Chain>, Vec<Rule>) {
    let decoded = decode(dump);
    let chains = decoded
        .table(table)
        .map(|t| t.chains.clone())
        .unwrap_or_default();
    let rules = chains.iter().flat_map(|c| c.rules.clone()).collect();
    (chains, rules)
}

/// Project the recognized options of a spec into the rule's fields.
///
/// One pass, left to right over whitespace-split tokens; a repeated option
/// overwrites the earlier value. Unknown tokens are skipped, never an
/// error. An absent protocol reports as `all`.
fn project_spec(rule: &mut Rule, spec: &str) {
    let parts: Vec<&str> = spec.split_whitespace().collect();
    let mut i = 0;
    while i < parts.len() {
        let value = parts.get(i + 1).copied();
        match parts[i] {
            "-p" => {
                if let Some(v) = value {
                    rule.protocol = v.to_string();
                    i += 1;
                }
            }
            "-s" => {
                if let Some(v) = value {
                    rule.source_ip = v.to_string();
                    i += 1;
                }
            }
            "--sport" | "--source-port" => {
                if let Some(v) = value {
                    rule.source_port = v.to_string();
                    i += 1;
                }
            }
            "-d" => {
                if let Some(v) = value {
                    rule.dest_ip = v.to_string();
                    i += 1;
                }
            }
            "--dport" | "--destination-port" => {
                if let Some(v) = value {
                    rule.dest_port = v.to_string();
                    i += 1;
                }
            }
            "-j" => {
                if let Some(v) = value {
                    rule.action = v.to_string();
                    i += 1;
                }
            }
            "-i" => {
                if let Some(v) = value {
                    rule.interface = v.to_string();
                    i += 1;
                }
            }
            "--ctstate" => {
                if let Some(v) = value {
                    rule.state = v.split(',').map(str::to_string).collect();
                    i += 1;
                }
            }
            "--to-destination" => {
                if let Some(v) = value {
                    match v.split_once(':') {
                        Some((addr, port)) => {
                            rule.to_source = addr.to_string();
                            rule.to_port = port.to_string();
                        }
                        None => rule.to_source = v.to_string(),
                    }
                    i += 1;
                }
            }
            "--to-source" => {
                if let Some(v) = value {
                    rule.to_source = v.to_string();
                    i += 1;
                }
            }
            "--to-ports" => {
                if let Some(v) = value {
                    rule.to_port = v.to_string();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    if rule.protocol.is_empty() {
        rule.protocol = "all".to_string();
    }
}

/// Extract the `--comment` value from a spec.
///
/// Quoted comments keep their embedded spaces; unquoted ones end at the
/// next whitespace.
fn parse_comment(spec: &str) -> String {
    let Some(idx) = spec.find("--comment") else {
        return String::new();
    };
    let rest = spec[idx + "--comment".len()..].trim_start();
    if rest.is_empty() {
        return String::new();
    }
    let first = rest.as_bytes()[0];
    if first == b'"' || first == b'\'' {
        let quote = first as char;
        let body = &rest[1..];
        return match body.find(quote) {
            Some(end) => body[..end].to_string(),
            None => body.to_string(),
        };
    }
    rest.split_whitespace().next().unwrap_or("").to_string()
}

/// Encode a structured rule into arguments for `-A <chain>` or `-I <chain> <pos>`.
///
/// Emission order is fixed so identical inputs produce identical command
/// lines. Port matchers only make sense with a concrete protocol, so they
/// are dropped when the protocol is empty or `all`.
pub fn rule_args(input: &RuleInput) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let concrete_proto = !input.protocol.is_empty() && input.protocol != "all";

    if concrete_proto {
        args.push("-p".into());
        args.push(input.protocol.clone());
    }
    if !input.source_ip.is_empty() {
        args.push("-s".into());
        args.push(input.source_ip.clone());
    }
    if !input.source_port.is_empty() && concrete_proto {
        args.push("--sport".into());
        args.push(input.source_port.clone());
    }
    if !input.dest_ip.is_empty() {
        args.push("-d".into());
        args.push(input.dest_ip.clone());
    }
    if !input.dest_port.is_empty() && concrete_proto {
        args.push("--dport".into());
        args.push(input.dest_port.clone());
    }
    if !input.state.is_empty() {
        args.push("-m".into());
        args.push("conntrack".into());
        args.push("--ctstate".into());
        args.push(input.state.join(","));
    }
    if !input.interface.is_empty() {
        args.push("-i".into());
        args.push(input.interface.clone());
    }
    if !input.action.is_empty() {
        args.push("-j".into());
        args.push(input.action.clone());

        match input.action.as_str() {
            "DNAT" => {
                if !input.to_source.is_empty() || !input.to_port.is_empty() {
                    let dest = if input.to_port.is_empty() {
                        input.to_source.clone()
                    } else {
                        format!("{}:{}", input.to_source, input.to_port)
                    };
                    args.push("--to-destination".into());
                    args.push(dest);
                }
            }
            "SNAT" => {
                if !input.to_source.is_empty() {
                    args.push("--to-source".into());
                    args.push(input.to_source.clone());
                }
            }
            "REDIRECT" => {
                if !input.to_port.is_empty() {
                    args.push("--to-ports".into());
                    args.push(input.to_port.clone());
                }
            }
            _ => {}
        }
    }
    if !input.comment.is_empty() {
        args.push("-m".into());
        args.push("comment".into());
        args.push("--comment".into());
        args.push(input.comment.clone());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC_DUMP: &str = "\
# Generated by iptables-save v1.8.7
*filter
:INPUT ACCEPT [12:34]
:FORWARD DROP [0:0]
-A INPUT -p tcp --dport 22 -j ACCEPT
COMMIT
";

    mod decoder {
        use super::*;

        #[test]
        fn test_builtin_chain_parse() {
            let dump = decode(BASIC_DUMP);
            let filter = dump.table(Table::Filter).unwrap();
            assert_eq!(filter.chains.len(), 2);

            let input = &filter.chains[0];
            assert_eq!(input.name, "INPUT");
            assert_eq!(input.policy, "ACCEPT");
            assert_eq!(input.counters, "[12:34]");
            assert!(input.builtin);

            let forward = &filter.chains[1];
            assert_eq!(forward.name, "FORWARD");
            assert_eq!(forward.policy, "DROP");
            assert!(forward.builtin);
            assert!(forward.rules.is_empty());

            let rule = &input.rules[0];
            assert_eq!(rule.num, 1);
            assert_eq!(rule.id, "INPUT:1");
            assert_eq!(rule.protocol, "tcp");
            assert_eq!(rule.dest_port, "22");
            assert_eq!(rule.action, "ACCEPT");
            assert_eq!(rule.spec, "-p tcp --dport 22 -j ACCEPT");
        }

        #[test]
        fn test_empty_dump_has_all_tables_empty() {
            let dump = decode("");
            assert_eq!(dump.tables.len(), Table::ALL.len());
            for table in Table::ALL {
                assert!(dump.table(table).unwrap().chains.is_empty());
            }
        }

        #[test]
        fn test_table_order_follows_input() {
            let text = "*nat\n:PREROUTING ACCEPT [0:0]\nCOMMIT\n*filter\n:INPUT ACCEPT [0:0]\nCOMMIT\n";
            let dump = decode(text);
            assert_eq!(dump.tables[0].table, Table::Nat);
            assert_eq!(dump.tables[1].table, Table::Filter);
            // the rest is appended empty
            assert_eq!(dump.tables.len(), Table::ALL.len());
        }

        #[test]
        fn test_user_chain_has_dash_policy() {
            let text = "*filter\n:WEB - [0:0]\n-A WEB -j RETURN\nCOMMIT\n";
            let dump = decode(text);
            let web = &dump.table(Table::Filter).unwrap().chains[0];
            assert_eq!(web.policy, "-");
            assert!(!web.builtin);
            assert_eq!(web.rules.len(), 1);
        }

        #[test]
        fn test_rule_before_chain_header_autocreates_chain() {
            let text = "*filter\n-A ORPHAN -j DROP\nCOMMIT\n";
            let dump = decode(text);
            let orphan = &dump.table(Table::Filter).unwrap().chains[0];
            assert_eq!(orphan.name, "ORPHAN");
            assert!(!orphan.builtin);
            assert_eq!(orphan.rules[0].num, 1);
        }

        #[test]
        fn test_unknown_table_is_dropped() {
            let text = "*bogus\n:X ACCEPT [0:0]\n-A X -j DROP\nCOMMIT\n*filter\n:INPUT ACCEPT [0:0]\nCOMMIT\n";
            let dump = decode(text);
            assert_eq!(dump.tables.len(), Table::ALL.len());
            assert_eq!(dump.tables[0].table, Table::Filter);
        }

        #[test]
        fn test_rule_numbering_is_dense_per_chain() {
            let text = "*filter\n:A - [0:0]\n:B - [0:0]\n-A A -j DROP\n-A B -j DROP\n-A A -j RETURN\nCOMMIT\n";
            let dump = decode(text);
            let chains = &dump.table(Table::Filter).unwrap().chains;
            assert_eq!(chains[0].rules.iter().map(|r| r.num).collect::<Vec<_>>(), vec![1, 2]);
            assert_eq!(chains[1].rules[0].num, 1);
            assert_eq!(chains[0].rules[1].id, "A:2");
        }

        #[test]
        fn test_unknown_options_are_preserved_in_spec() {
            let text = "*filter\n:INPUT ACCEPT [0:0]\n-A INPUT -m bizarre --wiggle 3 -j DROP\nCOMMIT\n";
            let dump = decode(text);
            let rule = &dump.table(Table::Filter).unwrap().chains[0].rules[0];
            assert_eq!(rule.spec, "-m bizarre --wiggle 3 -j DROP");
            assert_eq!(rule.action, "DROP");
            assert_eq!(rule.protocol, "all");
        }

        #[test]
        fn test_chain_without_counters() {
            let text = "*filter\n:INPUT ACCEPT\nCOMMIT\n";
            let dump = decode(text);
            let input = &dump.table(Table::Filter).unwrap().chains[0];
            assert_eq!(input.policy, "ACCEPT");
            assert_eq!(input.counters, "");
        }

        #[test]
        fn test_parse_table_filters_and_flattens() {
            let (chains, rules) = parse_table(BASIC_DUMP, Table::Filter);
            assert_eq!(chains.len(), 2);
            assert_eq!(rules.len(), 1);
            assert_eq!(rules[0].chain, "INPUT");
            assert_eq!(rules[0].table, "filter");

            let (chains, rules) = parse_table(BASIC_DUMP, Table::Nat);
            assert!(chains.is_empty());
            assert!(rules.is_empty());
        }
    }

    mod projection {
        use super::*;

        fn project(spec: &str) -> Rule {
            let mut rule = Rule::default();
            project_spec(&mut rule, spec);
            rule.comment = parse_comment(spec);
            rule
        }

        #[test]
        fn test_full_spec() {
            let rule = project(
                "-s 10.0.0.0/8 -d 192.168.1.10/32 -i eth0 -p tcp --sport 1024 --dport 443 \
                 -m conntrack --ctstate NEW,ESTABLISHED -j ACCEPT",
            );
            assert_eq!(rule.source_ip, "10.0.0.0/8");
            assert_eq!(rule.dest_ip, "192.168.1.10/32");
            assert_eq!(rule.interface, "eth0");
            assert_eq!(rule.protocol, "tcp");
            assert_eq!(rule.source_port, "1024");
            assert_eq!(rule.dest_port, "443");
            assert_eq!(rule.state, vec!["NEW", "ESTABLISHED"]);
            assert_eq!(rule.action, "ACCEPT");
        }

        #[test]
        fn test_missing_protocol_reports_all() {
            assert_eq!(project("-j DROP").protocol, "all");
        }

        #[test]
        fn test_later_occurrence_wins() {
            let rule = project("-p udp -p tcp -j ACCEPT");
            assert_eq!(rule.protocol, "tcp");
        }

        #[test]
        fn test_long_port_option_spellings() {
            let rule = project("-p tcp --source-port 53 --destination-port 8053 -j ACCEPT");
            assert_eq!(rule.source_port, "53");
            assert_eq!(rule.dest_port, "8053");
        }

        #[test]
        fn test_to_destination_with_addr_and_port() {
            let rule = project("-p tcp -j DNAT --to-destination 10.0.0.1:8080");
            assert_eq!(rule.to_source, "10.0.0.1");
            assert_eq!(rule.to_port, "8080");
        }

        #[test]
        fn test_to_destination_port_only() {
            let rule = project("-p tcp -j DNAT --to-destination :8080");
            assert_eq!(rule.to_source, "");
            assert_eq!(rule.to_port, "8080");
        }

        #[test]
        fn test_to_destination_addr_only() {
            let rule = project("-j DNAT --to-destination 10.0.0.9");
            assert_eq!(rule.to_source, "10.0.0.9");
            assert_eq!(rule.to_port, "");
        }

        #[test]
        fn test_to_source_and_to_ports() {
            let rule = project("-j SNAT --to-source 203.0.113.7");
            assert_eq!(rule.to_source, "203.0.113.7");
            let rule = project("-p tcp -j REDIRECT --to-ports 8443");
            assert_eq!(rule.to_port, "8443");
        }

        #[test]
        fn test_dangling_option_at_end_is_ignored() {
            let rule = project("-j ACCEPT -p");
            assert_eq!(rule.action, "ACCEPT");
            assert_eq!(rule.protocol, "all");
        }
    }

    mod comments {
        use super::*;

        #[test]
        fn test_double_quoted_comment_with_spaces() {
            assert_eq!(
                parse_comment(r#"-j ACCEPT -m comment --comment "allow web traffic""#),
                "allow web traffic"
            );
        }

        #[test]
        fn test_single_quoted_comment() {
            assert_eq!(
                parse_comment("-m comment --comment 'single quoted' -j DROP"),
                "single quoted"
            );
        }

        #[test]
        fn test_bare_comment_ends_at_whitespace() {
            assert_eq!(parse_comment("-m comment --comment web -j DROP"), "web");
        }

        #[test]
        fn test_unterminated_quote_takes_rest() {
            assert_eq!(parse_comment(r#"-m comment --comment "open ended"#), "open ended");
        }

        #[test]
        fn test_no_comment() {
            assert_eq!(parse_comment("-p tcp -j ACCEPT"), "");
            assert_eq!(parse_comment("-m comment --comment"), "");
        }
    }

    mod encoder {
        use super::*;

        #[test]
        fn test_dnat_encoding() {
            let input = RuleInput {
                protocol: "tcp".into(),
                dest_port: "80".into(),
                action: "DNAT".into(),
                to_source: "10.0.0.5".into(),
                to_port: "8080".into(),
                ..Default::default()
            };
            assert_eq!(
                rule_args(&input).join(" "),
                "-p tcp --dport 80 -j DNAT --to-destination 10.0.0.5:8080"
            );
        }

        #[test]
        fn test_dnat_port_only_gets_leading_colon() {
            let input = RuleInput {
                protocol: "tcp".into(),
                action: "DNAT".into(),
                to_port: "8080".into(),
                ..Default::default()
            };
            assert_eq!(
                rule_args(&input).join(" "),
                "-p tcp -j DNAT --to-destination :8080"
            );
        }

        #[test]
        fn test_snat_and_redirect() {
            let snat = RuleInput {
                action: "SNAT".into(),
                to_source: "203.0.113.7".into(),
                ..Default::default()
            };
            assert_eq!(rule_args(&snat).join(" "), "-j SNAT --to-source 203.0.113.7");

            let redirect = RuleInput {
                protocol: "tcp".into(),
                action: "REDIRECT".into(),
                to_port: "8443".into(),
                ..Default::default()
            };
            assert_eq!(
                rule_args(&redirect).join(" "),
                "-p tcp -j REDIRECT --to-ports 8443"
            );
        }

        #[test]
        fn test_all_protocol_is_omitted_and_gates_ports() {
            let input = RuleInput {
                protocol: "all".into(),
                source_port: "1024".into(),
                dest_port: "443".into(),
                action: "ACCEPT".into(),
                ..Default::default()
            };
            assert_eq!(rule_args(&input).join(" "), "-j ACCEPT");
        }

        #[test]
        fn test_conntrack_state_and_comment() {
            let input = RuleInput {
                state: vec!["NEW".into(), "ESTABLISHED".into()],
                interface: "eth0".into(),
                action: "ACCEPT".into(),
                comment: "keepalive".into(),
                ..Default::default()
            };
            assert_eq!(
                rule_args(&input).join(" "),
                "-m conntrack --ctstate NEW,ESTABLISHED -i eth0 -j ACCEPT -m comment --comment keepalive"
            );
        }

        #[test]
        fn test_empty_input_encodes_to_nothing() {
            assert!(rule_args(&RuleInput::default()).is_empty());
        }
    }

    mod roundtrip {
        use super::*;

        // Structured set survives decode -> encode -> decode.
        #[test]
        fn test_decode_encode_roundtrip_preserves_projection() {
            let inputs = [
                RuleInput {
                    protocol: "tcp".into(),
                    source_ip: "10.0.0.0/8".into(),
                    source_port: "1024".into(),
                    dest_ip: "192.168.0.1/32".into(),
                    dest_port: "443".into(),
                    state: vec!["NEW".into()],
                    interface: "eth1".into(),
                    action: "ACCEPT".into(),
                    comment: "web".into(),
                    ..Default::default()
                },
                RuleInput {
                    protocol: "udp".into(),
                    dest_port: "53".into(),
                    action: "DROP".into(),
                    ..Default::default()
                },
            ];

            let mut text = String::from("*filter\n:INPUT ACCEPT [0:0]\n");
            for input in &inputs {
                text.push_str(&format!("-A INPUT {}\n", rule_args(input).join(" ")));
            }
            text.push_str("COMMIT\n");

            let (_, rules) = parse_table(&text, Table::Filter);
            assert_eq!(rules.len(), inputs.len());
            for (rule, input) in rules.iter().zip(&inputs) {
                assert_eq!(rule.protocol, input.protocol);
                assert_eq!(rule.source_ip, input.source_ip);
                assert_eq!(rule.source_port, input.source_port);
                assert_eq!(rule.dest_ip, input.dest_ip);
                assert_eq!(rule.dest_port, input.dest_port);
                assert_eq!(rule.state, input.state);
                assert_eq!(rule.interface, input.interface);
                assert_eq!(rule.action, input.action);
                assert_eq!(rule.comment, input.comment);
            }
        }

        // Chain structure and per-chain rule counts survive a re-encode of
        // the decoded model.
        #[test]
        fn test_reencoded_dump_keeps_structure() {
            let original = decode(BASIC_DUMP);
            let mut text = String::new();
            for table in &original.tables {
                if table.chains.is_empty() {
                    continue;
                }
                text.push_str(&format!("*{}\n", table.table));
                for chain in &table.chains {
                    text.push_str(&format!(":{} {} {}\n", chain.name, chain.policy, chain.counters));
                }
                for chain in &table.chains {
                    for rule in &chain.rules {
                        text.push_str(&format!("-A {} {}\n", chain.name, rule.spec));
                    }
                }
                text.push_str("COMMIT\n");
            }

            let redecoded = decode(&text);
            let a = original.table(Table::Filter).unwrap();
            let b = redecoded.table(Table::Filter).unwrap();
            assert_eq!(a.chains.len(), b.chains.len());
            for (ca, cb) in a.chains.iter().zip(&b.chains) {
                assert_eq!(ca.name, cb.name);
                assert_eq!(ca.policy, cb.policy);
                assert_eq!(ca.rules.len(), cb.rules.len());
                for (ra, rb) in ca.rules.iter().zip(&cb.rules) {
                    assert_eq!(ra.spec, rb.spec);
                    assert_eq!(ra.num, rb.num);
                }
            }
        }
    }
}
