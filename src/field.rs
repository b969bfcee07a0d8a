use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::dictionary::InputContext;

pub type FieldId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    TextArea,
    Search,
    Email,
    Url,
    Tel,
    Password,
    Hidden,
    /// Any other input type (checkbox, number, date, credit-card, ...).
    Excluded(String),
}

impl FieldKind {
    /// Classify an element from its tag name and `type` attribute.
    ///
    /// An `<input>` without a type is a text input.
    pub fn from_element(tag: &str, input_type: Option<&str>) -> Self {
        if tag.eq_ignore_ascii_case("textarea") {
            return FieldKind::TextArea;
        }
        if !tag.eq_ignore_ascii_case("input") {
            return FieldKind::Excluded(tag.to_ascii_lowercase());
        }

        let input_type = input_type
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "text".to_string());
        match input_type.as_str() {
            "text" => FieldKind::Text,
            "search" => FieldKind::Search,
            "email" => FieldKind::Email,
            "url" => FieldKind::Url,
            "tel" => FieldKind::Tel,
            "password" => FieldKind::Password,
            "hidden" => FieldKind::Hidden,
            _ => FieldKind::Excluded(input_type),
        }
    }

    /// Completion context implied by the input type alone.
    pub fn context(&self) -> Option<InputContext> {
        match self {
            FieldKind::Email => Some(InputContext::Email),
            FieldKind::Search => Some(InputContext::Search),
            _ => None,
        }
    }

    pub fn is_mutable(&self) -> bool {
        !matches!(
            self,
            FieldKind::Password | FieldKind::Hidden | FieldKind::Excluded(_)
        )
    }
}

/// Synthetic notification dispatched after a programmatic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edit {
    Input,
    Change,
}

/// A live text-entry element owned by the host page.
///
/// Caret offsets are in characters, not bytes.
pub trait TextField: Send + Sync {
    fn id(&self) -> FieldId;
    fn kind(&self) -> FieldKind;
    fn value(&self) -> String;
    fn caret(&self) -> Option<usize>;
    fn set_value(&self, value: &str);
    fn set_caret(&self, caret: usize);
    fn dispatch(&self, edit: Edit);

    fn is_connected(&self) -> bool {
        true
    }

    /// Which contextual completion set applies. Hosts that know more about
    /// the page (a compose window, a social feed) override this.
    fn context(&self) -> Option<InputContext> {
        self.kind().context()
    }
}

/// Events reported by the host page.
pub enum PageEvent {
    /// A matching field was added to the document.
    Appeared(Arc<dyn TextField>),
    /// The field's value changed. `synthetic` marks notifications the
    /// watcher dispatched itself.
    Edited { id: FieldId, synthetic: bool },
    Removed(FieldId),
}

impl PageEvent {
    pub fn edited(id: FieldId) -> Self {
        PageEvent::Edited {
            id,
            synthetic: false,
        }
    }
}

impl fmt::Debug for PageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageEvent::Appeared(field) => f.debug_tuple("Appeared").field(&field.id()).finish(),
            PageEvent::Edited { id, synthetic } => f
                .debug_struct("Edited")
                .field("id", id)
                .field("synthetic", synthetic)
                .finish(),
            PageEvent::Removed(id) => f.debug_tuple("Removed").field(id).finish(),
        }
    }
}

#[derive(Debug, Default)]
struct EditorState {
    buf: Vec<char>,
    cursor: usize,
    connected: bool,
    dispatched: Vec<Edit>,
}

impl EditorState {
    fn insert_char(&mut self, c: char) {
        self.buf.insert(self.cursor, c);
        self.cursor += 1;
    }

    fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.cursor -= 1;
        self.buf.remove(self.cursor);
    }
}

/// An in-memory field; stands in for a DOM element in tests and the CLI.
///
/// When given an event sink, user edits and dispatched notifications are
/// reported as [`PageEvent::Edited`] the way a host page would.
pub struct MemoryField {
    id: FieldId,
    kind: FieldKind,
    context: Option<InputContext>,
    state: Mutex<EditorState>,
    events: Option<UnboundedSender<PageEvent>>,
}

impl MemoryField {
    pub fn new(id: FieldId, kind: FieldKind) -> Self {
        Self {
            id,
            context: kind.context(),
            kind,
            state: Mutex::new(EditorState {
                connected: true,
                ..Default::default()
            }),
            events: None,
        }
    }

    pub fn with_value(self, value: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.buf = value.chars().collect();
            state.cursor = state.buf.len();
        }
        self
    }

    pub fn with_context(mut self, context: Option<InputContext>) -> Self {
        self.context = context;
        self
    }

    pub fn with_event_sink(mut self, events: UnboundedSender<PageEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Simulate the user typing `text` at the caret, one edit per character.
    pub fn type_str(&self, text: &str) {
        for c in text.chars() {
            self.state.lock().insert_char(c);
            self.report(false);
        }
    }

    pub fn backspace(&self) {
        self.state.lock().backspace();
        self.report(false);
    }

    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    pub fn dispatched(&self) -> Vec<Edit> {
        self.state.lock().dispatched.clone()
    }

    fn report(&self, synthetic: bool) {
        if let Some(events) = &self.events {
            // A closed channel means nobody is watching any more.
            let _ = events.send(PageEvent::Edited {
                id: self.id,
                synthetic,
            });
        }
    }
}

impl TextField for MemoryField {
    fn id(&self) -> FieldId {
        self.id
    }

    fn kind(&self) -> FieldKind {
        self.kind.clone()
    }

    fn value(&self) -> String {
        self.state.lock().buf.iter().collect()
    }

    fn caret(&self) -> Option<usize> {
        Some(self.state.lock().cursor)
    }

    fn set_value(&self, value: &str) {
        let mut state = self.state.lock();
        state.buf = value.chars().collect();
        state.cursor = state.cursor.min(state.buf.len());
    }

    fn set_caret(&self, caret: usize) {
        let mut state = self.state.lock();
        state.cursor = caret.min(state.buf.len());
    }

    fn dispatch(&self, edit: Edit) {
        self.state.lock().dispatched.push(edit);
        if edit == Edit::Input {
            self.report(true);
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn context(&self) -> Option<InputContext> {
        self.context
    }
}
