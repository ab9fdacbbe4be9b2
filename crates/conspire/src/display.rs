//! Text projections of group membership

use crate::keys::KeyEntry;
use std::fmt::Write;

/// Aligned table: key id and fingerprint halves, then one identity per line
pub fn table(members: &[KeyEntry]) -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str(" Key Id          Key Fingerprint / Identity\n");
    out.push_str("---------------- --------------------------------------------------------\n");

    for member in members {
        let (head, tail) = member.fingerprint().halves();
        let _ = writeln!(out, "{} {} {}", member.key_id(), head, tail);
        for identity in &member.identities {
            let _ = writeln!(out, "{:17}{}", "", identity);
        }
    }

    out.push('\n');
    out
}

/// One `KEYID;FPR1:FPR2;ident1,ident2` line per member
pub fn terse(members: &[KeyEntry]) -> String {
    members
        .iter()
        .map(|member| {
            let (head, tail) = member.fingerprint().halves();
            format!(
                "{};{}:{};{}\n",
                member.key_id(),
                head,
                tail,
                member.identities.join(",")
            )
        })
        .collect()
}
