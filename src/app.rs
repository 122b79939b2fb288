use ratatui::widgets::ListState;
use tokio::sync::mpsc;
use tracing::debug;

use crate::chat::{Message, Role, Transcript, TYPING_PLACEHOLDER};
use crate::engine::EngineClient;
use crate::generate::EngineEvent;

pub const SYSTEM_PROMPT: &str = "You are a helpful AI agent helping users.";
pub const IDLE_PROMPT: &str = "Type a message...";
pub const BUSY_PROMPT: &str = "Generating...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,

    // Conversation
    pub transcript: Transcript,

    // Input state
    pub input: String,
    pub input_cursor: usize, // cursor position in input, in chars
    pub input_placeholder: &'static str,

    // Session state
    pub selected_model: String,
    pub is_loading: bool,
    pub model_loaded: bool,
    pub generating: bool,
    pub download_status: String,
    pub stats_text: String,

    // Transcript scrolling
    pub chat_scroll: u16,
    pub chat_height: u16, // inner height of the transcript area, set during render
    pub chat_width: u16,  // inner width, for wrap calculations

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    // Model picker state
    pub show_model_picker: bool,
    pub available_models: Vec<String>,
    pub model_picker_state: ListState,

    // Engine handle and the channel its background tasks report on
    pub engine: EngineClient,
    pub engine_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl App {
    pub fn new(
        engine: EngineClient,
        selected_model: String,
        engine_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            should_quit: false,
            input_mode: InputMode::Editing,

            transcript: Transcript::new(SYSTEM_PROMPT),

            input: String::new(),
            input_cursor: 0,
            input_placeholder: IDLE_PROMPT,

            selected_model,
            is_loading: false,
            model_loaded: false,
            generating: false,
            download_status: String::new(),
            stats_text: String::new(),

            chat_scroll: 0,
            chat_height: 0,
            chat_width: 0,

            animation_frame: 0,

            show_model_picker: false,
            available_models: Vec::new(),
            model_picker_state: ListState::default(),

            engine,
            engine_tx,
        }
    }

    /// Send action. Rejects empty input and re-entrant sends; otherwise
    /// appends the user message plus the assistant placeholder and returns
    /// the conversation snapshot to submit to the engine.
    pub fn on_message_send(&mut self) -> Option<Vec<Message>> {
        let input = self.input.trim().to_string();
        if input.is_empty() {
            return None;
        }
        if self.generating || self.is_loading || !self.model_loaded {
            return None;
        }

        debug!(input = %input, "sending message");
        self.input.clear();
        self.input_cursor = 0;
        self.input_placeholder = BUSY_PROMPT;

        self.transcript.push(Message::new(Role::User, input));
        self.transcript
            .push_display(Message::new(Role::Assistant, TYPING_PLACEHOLDER));
        self.generating = true;
        self.scroll_to_bottom();

        Some(self.transcript.conversation().to_vec())
    }

    /// Explicit load action. Resets session state and returns the model id
    /// to load, or None while another load or a generation is running.
    pub fn start_load(&mut self) -> Option<String> {
        if self.is_loading || self.generating {
            return None;
        }
        debug!(model = %self.selected_model, "starting model load");
        self.is_loading = true;
        self.model_loaded = false;
        self.download_status.clear();
        self.stats_text.clear();
        Some(self.selected_model.clone())
    }

    /// Applies an event from a background engine task. Sole mutation point
    /// for streaming state; runs on the UI loop.
    pub fn apply_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LoadProgress(text) => {
                self.download_status = text;
            }
            EngineEvent::LoadFinished(Ok(())) => {
                self.is_loading = false;
                self.model_loaded = true;
                self.download_status = format!("{} ready", self.selected_model);
            }
            EngineEvent::LoadFinished(Err(e)) => {
                self.is_loading = false;
                self.download_status.clear();
                self.transcript
                    .push_display(Message::new(Role::Assistant, format!("Error: {}", e)));
                self.scroll_to_bottom();
            }
            EngineEvent::Update(text) => {
                self.transcript.replace_last_display(&text);
                self.scroll_to_bottom();
            }
            EngineEvent::Finished { text, stats } => {
                self.transcript.commit_assistant(&text);
                self.generating = false;
                self.input_placeholder = IDLE_PROMPT;
                self.stats_text = stats.unwrap_or_default();
                self.scroll_to_bottom();
            }
            EngineEvent::Failed(e) => {
                self.transcript
                    .replace_last_display(&format!("Error: {}", e));
                self.generating = false;
                self.input_placeholder = IDLE_PROMPT;
                self.scroll_to_bottom();
            }
        }
    }

    // Transcript scrolling
    pub fn scroll_down(&mut self) {
        let max = self.total_chat_lines().saturating_sub(self.chat_height);
        if self.chat_scroll < max {
            self.chat_scroll = self.chat_scroll.saturating_add(1);
        }
    }

    pub fn scroll_up(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_sub(1);
    }

    /// Scroll so the newest entry is visible after each update.
    pub fn scroll_to_bottom(&mut self) {
        let total = self.total_chat_lines();
        let visible = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };
        self.chat_scroll = total.saturating_sub(visible);
    }

    fn total_chat_lines(&self) -> u16 {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total: u16 = 0;
        for msg in self.transcript.display() {
            total += 1; // Role line ("You:" or "AI:")
            for line in msg.content.lines() {
                // Character count, not byte length, for proper UTF-8 handling
                let char_count = line.chars().count();
                if char_count == 0 {
                    total += 1;
                } else {
                    total += ((char_count.saturating_sub(1) / wrap_width) + 1) as u16;
                }
            }
            total += 1; // Blank line after message
        }
        total
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.generating || self.is_loading {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    // Model picker methods
    pub fn open_model_picker(&mut self, models: Vec<String>) {
        self.available_models = models;
        if self.available_models.is_empty() {
            return;
        }
        // Select current model if in list, otherwise first
        let current_idx = self
            .available_models
            .iter()
            .position(|m| m == &self.selected_model)
            .unwrap_or(0);
        self.model_picker_state.select(Some(current_idx));
        self.show_model_picker = true;
    }

    pub fn model_picker_nav_down(&mut self) {
        let len = self.available_models.len();
        if len > 0 {
            let i = self.model_picker_state.selected().unwrap_or(0);
            self.model_picker_state.select(Some((i + 1).min(len - 1)));
        }
    }

    pub fn model_picker_nav_up(&mut self) {
        let i = self.model_picker_state.selected().unwrap_or(0);
        self.model_picker_state.select(Some(i.saturating_sub(1)));
    }

    /// Updates the selection only; no load occurs until the explicit load action.
    pub fn select_model(&mut self) {
        if let Some(i) = self.model_picker_state.selected() {
            if let Some(model) = self.available_models.get(i) {
                self.selected_model = model.clone();
                self.show_model_picker = false;
            }
        }
    }
}
