use super::Invocation;
use semiont_core::commands::ops::Exec;
use semiont_core::service::ServiceSelector;
use semiont_core::strategy::ExecOptions;
use std::time::Duration;

pub fn run(
    inv: &Invocation<'_>,
    command: &[String],
    interactive: bool,
    timeout_secs: Option<u64>,
) -> anyhow::Result<bool> {
    if matches!(inv.selector(), ServiceSelector::All) {
        anyhow::bail!("exec needs a single target; pass --service NAME");
    }
    if command.is_empty() {
        anyhow::bail!("no command given; usage: semiont exec --service NAME -- CMD...");
    }

    let op = Exec {
        command: shell_join(command),
        options: ExecOptions {
            interactive,
            timeout: timeout_secs.map(Duration::from_secs),
        },
    };
    super::run(inv, op)
}

/// Join argv back into one shell line, single-quoting words that need it.
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            let plain = !a.is_empty()
                && a.chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
            if plain {
                a.clone()
            } else {
                format!("'{}'", a.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_words_are_left_alone() {
        assert_eq!(shell_join(&argv(&["ls", "-la", "/var/log"])), "ls -la /var/log");
    }

    #[test]
    fn words_with_spaces_or_quotes_are_quoted() {
        assert_eq!(
            shell_join(&argv(&["echo", "hello world", "it's", ""])),
            r"echo 'hello world' 'it'\''s' ''"
        );
    }
}
