use crate::core::Result;
use minijinja::{context, AutoEscape, Environment, Error, ErrorKind};
use serde::Serialize;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Text { text: String },
    Image,
    Video,
}

impl Line {
    pub fn text(text: impl Into<String>) -> Self {
        Line::Text { text: text.into() }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Line>,
}

impl Message {
    pub fn new(role: Role, content: Vec<Line>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Line::text(text)])
    }
}

/// A compiled chat template. Output is plain text, never HTML-escaped.
pub struct ChatTemplate {
    env: Environment<'static>,
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_function("raise_exception", raise_exception);
        env.add_template_owned("chat", source.into())?;
        Ok(Self { env })
    }

    pub fn render(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
        bos_token: Option<&str>,
        eos_token: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("chat")?;
        Ok(template.render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
            bos_token => bos_token.unwrap_or(""),
            eos_token => eos_token.unwrap_or(""),
        })?)
    }
}

fn raise_exception(message: String) -> std::result::Result<String, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VlmError;

    #[test]
    fn test_renders_typed_content() {
        let template = ChatTemplate::new(
            "{% for m in messages %}{{ m['role'] }}:{% for c in m['content'] %}{% if c['type'] == 'image' %}<image>{% else %}{{ c['text'] }}{% endif %}{% endfor %}\n{% endfor %}",
        )
        .unwrap();
        let messages = vec![Message::new(
            Role::User,
            vec![Line::Image, Line::text("a < b & c")],
        )];

        let rendered = template.render(&messages, true, None, None).unwrap();
        assert_eq!(rendered, "user:<image>a < b & c\n");
    }

    #[test]
    fn test_raise_exception_surfaces_as_error() {
        let template = ChatTemplate::new("{{ raise_exception('roles must alternate') }}").unwrap();
        let err = template.render(&[], false, None, None).unwrap_err();
        assert!(matches!(err, VlmError::Template(_)));
    }
}
