// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

use serde::{Deserialize, Serialize};

/// Fixed palette for the output prefix
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    #[default]
    None,
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
}

const RESET: &str = "\x1b[0m";

impl Color {
    /// Unknown tokens map to no color
    pub fn from_token(token: &str) -> Color {
        match token.to_ascii_lowercase().as_str() {
            "black" => Color::Black,
            "red" => Color::Red,
            "green" => Color::Green,
            "yellow" => Color::Yellow,
            "blue" => Color::Blue,
            "magenta" => Color::Magenta,
            "cyan" => Color::Cyan,
            "white" => Color::White,
            _ => Color::None,
        }
    }

    fn code(&self) -> Option<u8> {
        match self {
            Color::None => None,
            Color::Black => Some(30),
            Color::Red => Some(31),
            Color::Green => Some(32),
            Color::Yellow => Some(33),
            Color::Blue => Some(34),
            Color::Magenta => Some(35),
            Color::Cyan => Some(36),
            Color::White => Some(37),
        }
    }

    pub fn escape(&self) -> String {
        self.code()
            .map(|code| format!("\x1b[0;{code}m"))
            .unwrap_or_default()
    }

    pub fn reset(&self) -> &'static str {
        if self.code().is_some() {
            RESET
        } else {
            ""
        }
    }
}

/// Decorates every line going through it with `<color><prefix>: <line><reset>`. Lines can span
/// several writes, the state carries over between calls.
#[derive(Debug, Clone)]
pub struct LineProbe {
    prefix: String,
    color: Color,
    at_line_start: bool,
}

impl LineProbe {
    pub fn new(prefix: impl Into<String>, color: Color) -> LineProbe {
        LineProbe {
            prefix: prefix.into(),
            color,
            at_line_start: true,
        }
    }

    pub fn decorate(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(chunk.len() + self.prefix.len() + 16);
        for byte in chunk {
            if self.at_line_start {
                output.extend_from_slice(self.color.escape().as_bytes());
                output.extend_from_slice(self.prefix.as_bytes());
                output.extend_from_slice(b": ");
                self.at_line_start = false;
            }
            if *byte == b'\n' {
                output.extend_from_slice(self.color.reset().as_bytes());
                self.at_line_start = true;
            }
            output.push(*byte);
        }
        output
    }
}
