// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Placeholder adapter for wiring up a new provider. Ignores every input
//! except the prompt and always succeeds locally with no subprocess spawn,
//! matching the reference placeholder provider used during integration.

pub const PROVIDER_NAME: &str = "xxx";

pub fn placeholder_reply(prompt: &str) -> String {
    format!("[xxx placeholder] prompt received: {prompt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_prompt() {
        assert_eq!(placeholder_reply("hello"), "[xxx placeholder] prompt received: hello");
    }
}
