//! Startup-script rendering.
//!
//! Scripts are plain shell with `{{NAME}}` placeholders. Block and comment
//! delimiters are moved out of the way so shell constructs such as `${#arr[@]}`
//! or `{%` inside heredocs pass through untouched. Unknown placeholders render empty.

use minijinja::syntax::SyntaxConfig;
use minijinja::Environment;
use std::collections::BTreeMap;

pub type TemplateParams = BTreeMap<&'static str, String>;

fn environment() -> Result<Environment<'static>, minijinja::Error> {
    let syntax = SyntaxConfig::builder()
        .variable_delimiters("{{", "}}")
        .block_delimiters("{%@", "@%}")
        .comment_delimiters("{#@", "@#}")
        .build()?;

    let mut env = Environment::new();
    env.set_syntax(syntax);
    env.set_keep_trailing_newline(true);
    Ok(env)
}

pub fn render(template: &str, params: &TemplateParams) -> Result<String, minijinja::Error> {
    environment()?.render_str(template, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&'static str, &str)]) -> TemplateParams {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let out = render(
            "K8S_VERSION={{K8S_VERSION}}\nROLE={{ K8S_ROLE }}\n",
            &params(&[("K8S_VERSION", "1.35"), ("K8S_ROLE", "cp")]),
        )
        .unwrap();
        assert_eq!(out, "K8S_VERSION=1.35\nROLE=cp\n");
    }

    #[test]
    fn test_shell_syntax_passes_through() {
        let script = "n=${#nodes[@]}\necho \"{% raw %}\"\nfor i in $(seq 1 {{ACCESS_NUM}}); do :; done\n";
        let out = render(script, &params(&[("ACCESS_NUM", "2")])).unwrap();
        assert!(out.contains("n=${#nodes[@]}"));
        assert!(out.contains("{% raw %}"));
        assert!(out.contains("seq 1 2"));
    }

    #[test]
    fn test_missing_placeholder_renders_empty() {
        assert_eq!(render("cp={{CP_NAME}}", &TemplateParams::new()).unwrap(), "cp=");
    }
}
