/// Fixed-capacity token buffer and write cursor shared by every request.
///
/// The buffer is allocated once for `context_length` tokens and reused; positions
/// below `cursor` are committed, writes land at `cursor` and either overwrite a
/// provisional prompt slot or append.
#[derive(Debug)]
pub struct SessionState {
    tokens: Vec<u32>,
    cursor: usize,
    context_length: usize,
}

impl SessionState {
    pub fn new(context_length: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(context_length),
            cursor: 0,
            context_length,
        }
    }

    pub fn reset(&mut self) {
        self.tokens.clear();
        self.cursor = 0;
    }

    /// Loads a fresh input sequence; the caller has already checked it fits.
    pub fn load_prompt(&mut self, prompt: &[u32]) {
        self.reset();
        self.tokens.extend_from_slice(prompt);
    }

    /// Places the cursor where prefill left off.
    pub fn start_at(&mut self, position: usize) -> Result<(), String> {
        if position > self.tokens.len() {
            return Err(format!(
                "prefill returned position {} past input length {}",
                position,
                self.tokens.len()
            ));
        }
        if position > self.max_cursor() {
            return Err(format!(
                "prefill returned position {} past context bound {}",
                position,
                self.max_cursor()
            ));
        }
        self.cursor = position;
        Ok(())
    }

    /// Writes `token` at the cursor. Returns `true` when it overwrote an existing slot.
    pub fn commit(&mut self, token: u32) -> bool {
        if self.cursor < self.tokens.len() {
            self.tokens[self.cursor] = token;
            true
        } else {
            self.tokens.push(token);
            false
        }
    }

    pub fn advance(&mut self) {
        debug_assert!(self.cursor < self.max_cursor());
        self.cursor += 1;
    }

    pub fn has_room(&self) -> bool {
        self.cursor < self.max_cursor()
    }

    pub fn max_cursor(&self) -> usize {
        self.context_length - 1
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn capacity(&self) -> usize {
        self.tokens.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState;

    #[test]
    fn appends_past_prompt_and_overwrites_inside_it() {
        let mut session = SessionState::new(8);
        session.load_prompt(&[10, 11, 12, 13]);
        session.start_at(2).expect("start inside prompt");

        assert!(session.commit(99));
        session.advance();
        assert_eq!(session.tokens(), &[10, 11, 99, 13]);

        session.advance();
        assert!(!session.commit(42));
        assert_eq!(session.tokens(), &[10, 11, 99, 13, 42]);
        assert!(session.tokens().len() >= session.cursor());
    }

    #[test]
    fn reset_keeps_the_allocation() {
        let mut session = SessionState::new(16);
        let capacity = session.capacity();
        session.load_prompt(&[1, 2, 3]);
        session.start_at(3).expect("start");
        for t in 0..12 {
            session.commit(t);
            session.advance();
        }
        assert!(!session.has_room());
        assert_eq!(session.cursor(), 15);

        session.reset();
        assert_eq!(session.cursor(), 0);
        assert!(session.tokens().is_empty());
        assert_eq!(session.capacity(), capacity);
    }

    #[test]
    fn start_rejects_positions_past_input_or_bound() {
        let mut session = SessionState::new(4);
        session.load_prompt(&[1, 2]);
        assert!(session.start_at(3).is_err());

        let mut full = SessionState::new(3);
        full.load_prompt(&[1, 2, 3]);
        assert!(full.start_at(3).is_err());
        assert!(full.start_at(2).is_ok());
        assert!(!full.has_room());
    }
}
