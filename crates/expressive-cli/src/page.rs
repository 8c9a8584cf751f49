//! The form page served at `/`.

use expressive::lang::{DEFAULT_TARGET_LANGUAGE, LanguageTable};

use crate::server::EXAMPLES;

const STYLE: &str = r#"
body { font-family: system-ui, sans-serif; max-width: 960px; margin: 2rem auto; padding: 0 1rem; }
h1 { text-align: center; }
#duplicate-button { display: block; margin: 0 auto 1rem; width: fit-content; color: #fff; background: #1565c0; border-radius: 100vh; padding: .4rem 1rem; text-decoration: none; }
.row { display: flex; gap: 1.5rem; flex-wrap: wrap; }
.column { flex: 1 1 20rem; display: flex; flex-direction: column; gap: .75rem; }
.group { border: 1px solid #ddd; border-radius: 8px; padding: .75rem; display: flex; flex-direction: column; gap: .5rem; }
label { font-weight: 600; }
textarea { width: 100%; min-height: 6rem; }
#warnings { color: #b26a00; }
#error { color: #c62828; }
table { border-collapse: collapse; margin-top: 1.5rem; }
td, th { border: 1px solid #ddd; padding: .35rem .75rem; }
"#;

const SCRIPT: &str = r#"
const form = document.getElementById('run-form');
const button = document.getElementById('run-button');
const outAudio = document.getElementById('output-audio');
const outText = document.getElementById('output-text');
const warnings = document.getElementById('warnings');
const errorBox = document.getElementById('error');
const fileInput = document.getElementById('input-audio');
const recordButton = document.getElementById('record-button');
const recordStatus = document.getElementById('record-status');
let recorder = null;
let recording = null;

// Browsers record webm/ogg, so the clip is re-encoded as 16-bit mono WAV.
function encodeWav(buffer) {
  const samples = buffer.getChannelData(0);
  const view = new DataView(new ArrayBuffer(44 + samples.length * 2));
  const text = (offset, s) => {
    for (let i = 0; i < s.length; i++) view.setUint8(offset + i, s.charCodeAt(i));
  };
  text(0, 'RIFF');
  view.setUint32(4, 36 + samples.length * 2, true);
  text(8, 'WAVE');
  text(12, 'fmt ');
  view.setUint32(16, 16, true);
  view.setUint16(20, 1, true);
  view.setUint16(22, 1, true);
  view.setUint32(24, buffer.sampleRate, true);
  view.setUint32(28, buffer.sampleRate * 2, true);
  view.setUint16(32, 2, true);
  view.setUint16(34, 16, true);
  text(36, 'data');
  view.setUint32(40, samples.length * 2, true);
  samples.forEach((s, i) => view.setInt16(44 + i * 2, Math.max(-1, Math.min(1, s)) * 0x7fff, true));
  return new Blob([view], { type: 'audio/wav' });
}

async function finishRecording(chunks) {
  const ctx = new AudioContext();
  try {
    const decoded = await ctx.decodeAudioData(await new Blob(chunks).arrayBuffer());
    recording = encodeWav(decoded);
    fileInput.value = '';
    recordStatus.textContent = 'Recorded ' + decoded.duration.toFixed(1) + ' s';
  } catch (e) {
    errorBox.textContent = e.message;
  } finally {
    ctx.close();
  }
}

recordButton.addEventListener('click', async () => {
  if (recorder) {
    recorder.stop();
    return;
  }
  errorBox.textContent = '';
  try {
    const stream = await navigator.mediaDevices.getUserMedia({ audio: true });
    const chunks = [];
    recorder = new MediaRecorder(stream);
    recorder.ondataavailable = (ev) => chunks.push(ev.data);
    recorder.onstop = () => {
      stream.getTracks().forEach((t) => t.stop());
      recorder = null;
      recordButton.textContent = 'Record';
      finishRecording(chunks);
    };
    recorder.start();
    recordButton.textContent = 'Stop';
    recordStatus.textContent = 'Recording...';
  } catch (e) {
    recorder = null;
    errorBox.textContent = e.message;
  }
});

fileInput.addEventListener('change', () => {
  recording = null;
  recordStatus.textContent = '';
});

function show(result) {
  outAudio.src = result.audio_url;
  outText.value = result.text;
  warnings.textContent = (result.warnings || []).join('\n');
}

async function submit(url, body) {
  button.disabled = true;
  errorBox.textContent = '';
  warnings.textContent = '';
  try {
    const resp = await fetch(url, { method: 'POST', body });
    const json = await resp.json();
    if (!resp.ok) throw new Error(json.error || resp.statusText);
    show(json);
  } catch (e) {
    errorBox.textContent = e.message;
  } finally {
    button.disabled = false;
  }
}

form.addEventListener('submit', (ev) => {
  ev.preventDefault();
  const body = new FormData(form);
  if (recording) {
    body.set('audio', recording, 'recording.wav');
  } else if (!fileInput.files.length) {
    errorBox.textContent = 'Upload or record some speech first.';
    return;
  }
  submit('/api/run', body);
});

document.querySelectorAll('[data-example]').forEach((row) => {
  row.addEventListener('click', () => {
    document.getElementById('target-language').value = row.dataset.language;
    submit('/api/examples/' + row.dataset.example, null);
  });
});
"#;

/// Render the page. Language names and example rows are fixed ASCII text.
pub fn render_page(show_duplicate_button: bool, space_id: Option<&str>) -> String {
    let mut html = String::with_capacity(8 * 1024);
    html.push_str("<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str("<title>Seamless Expressive</title>\n<style>");
    html.push_str(STYLE);
    html.push_str("</style>\n</head>\n<body>\n<h1>Seamless Expressive</h1>\n");

    if show_duplicate_button {
        let href = space_id
            .map(|id| format!("https://huggingface.co/spaces/{}?duplicate=true", escape(id)))
            .unwrap_or_else(|| "#".to_string());
        html.push_str(&format!(
            "<a id=\"duplicate-button\" href=\"{href}\" target=\"_blank\">Duplicate Space for private use</a>\n"
        ));
    }

    html.push_str("<div class=\"row\">\n<div class=\"column\">\n");
    html.push_str("<form id=\"run-form\" class=\"group\" enctype=\"multipart/form-data\">\n");
    html.push_str("<label for=\"input-audio\">Input speech</label>\n");
    html.push_str(
        "<input id=\"input-audio\" name=\"audio\" type=\"file\" accept=\"audio/*\">\n",
    );
    html.push_str(
        "<div><button id=\"record-button\" type=\"button\">Record</button> <span id=\"record-status\"></span></div>\n",
    );
    html.push_str("<label for=\"target-language\">Target language</label>\n");
    html.push_str("<select id=\"target-language\" name=\"target_language\">\n");
    for name in LanguageTable.names() {
        let selected = if name == DEFAULT_TARGET_LANGUAGE {
            " selected"
        } else {
            ""
        };
        html.push_str(&format!("<option value=\"{name}\"{selected}>{name}</option>\n"));
    }
    html.push_str("</select>\n");
    html.push_str("<button id=\"run-button\" type=\"submit\">Run</button>\n</form>\n</div>\n");

    html.push_str("<div class=\"column\">\n<div class=\"group\">\n");
    html.push_str("<label for=\"output-audio\">Translated speech</label>\n");
    html.push_str("<audio id=\"output-audio\" controls></audio>\n");
    html.push_str("<label for=\"output-text\">Translated text</label>\n");
    html.push_str("<textarea id=\"output-text\" readonly></textarea>\n");
    html.push_str("<div id=\"warnings\"></div>\n<div id=\"error\"></div>\n");
    html.push_str("</div>\n</div>\n</div>\n");

    html.push_str("<table>\n<caption>Examples</caption>\n");
    html.push_str("<tr><th>Input speech</th><th>Target language</th></tr>\n");
    for (i, ex) in EXAMPLES.iter().enumerate() {
        html.push_str(&format!(
            "<tr data-example=\"{i}\" data-language=\"{lang}\"><td><audio controls src=\"/assets/{audio}\"></audio> {audio}</td><td>{lang}</td></tr>\n",
            audio = ex.audio,
            lang = ex.target_language,
        ));
    }
    html.push_str("</table>\n<script>");
    html.push_str(SCRIPT);
    html.push_str("</script>\n</body>\n</html>\n");
    html
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
