// GNSS click — u-blox LEA-6S style receiver, NMEA 0183 over UART.
//
// The parser is a byte-at-a-time accumulator so it can sit directly in
// a UART RX path: feed it bytes, get a verified sentence back when the
// terminator arrives. Checksum is the XOR of everything between '$'
// and '*', compared against the two hex digits that follow. Position
// fields come out as signed decimal degrees, south and west negative.

use embedded_io::Read;

use crate::error::Error;

// NMEA caps a sentence at 82 characters including "$" and CRLF
const MAX_SENTENCE: usize = 84;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GgaFix {
    /// UTC as reported, hhmmss.sss.
    pub time: f32,
    pub latitude: f64,
    pub longitude: f64,
    /// 0 = no fix, 1 = GPS, 2 = differential.
    pub quality: u8,
    pub satellites: u8,
    pub hdop: f32,
    /// Meters above mean sea level.
    pub altitude: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmcFix {
    /// UTC as reported, hhmmss.sss.
    pub time: f32,
    /// Receiver marks the fix valid ('A' status).
    pub valid: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_knots: f32,
    pub course: f32,
    /// ddmmyy as reported.
    pub date: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sentence {
    Gga(GgaFix),
    Rmc(RmcFix),
    /// Verified but not a sentence this driver decodes.
    Other,
}

/// Streaming NMEA accumulator.
#[derive(Debug)]
pub struct NmeaParser {
    buf: [u8; MAX_SENTENCE],
    len: usize,
    in_sentence: bool,
}

impl Default for NmeaParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NmeaParser {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_SENTENCE],
            len: 0,
            in_sentence: false,
        }
    }

    /// Feed one byte. A completed, checksum-verified sentence comes
    /// back decoded; a bad checksum surfaces as `Error::Crc`.
    pub fn push(&mut self, byte: u8) -> Result<Option<Sentence>, Error<core::convert::Infallible>> {
        match byte {
            b'$' => {
                self.len = 0;
                self.in_sentence = true;
                Ok(None)
            }
            b'\r' | b'\n' => {
                if !self.in_sentence || self.len == 0 {
                    return Ok(None);
                }
                self.in_sentence = false;
                let sentence = &self.buf[..self.len];
                self.verify(sentence)?;
                Ok(Some(decode(sentence)))
            }
            _ if self.in_sentence => {
                if self.len < MAX_SENTENCE {
                    self.buf[self.len] = byte;
                    self.len += 1;
                } else {
                    // oversized line, resync on the next '$'
                    self.in_sentence = false;
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn verify(&self, sentence: &[u8]) -> Result<(), Error<core::convert::Infallible>> {
        let Some(star) = sentence.iter().position(|&b| b == b'*') else {
            // unterminated checksum field; treat as corrupt
            return Err(Error::Crc {
                computed: checksum(sentence),
                received: 0,
            });
        };
        let computed = checksum(&sentence[..star]);
        let received = parse_hex_pair(&sentence[star + 1..]).ok_or(Error::Crc {
            computed,
            received: 0,
        })?;
        if computed != received {
            return Err(Error::Crc { computed, received });
        }
        Ok(())
    }
}

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, b| acc ^ b)
}

fn parse_hex_pair(bytes: &[u8]) -> Option<u8> {
    if bytes.len() < 2 {
        return None;
    }
    let hi = (bytes[0] as char).to_digit(16)? as u8;
    let lo = (bytes[1] as char).to_digit(16)? as u8;
    Some((hi << 4) | lo)
}

fn decode(sentence: &[u8]) -> Sentence {
    let star = sentence.iter().position(|&b| b == b'*').unwrap_or(sentence.len());
    let body = &sentence[..star];
    let Ok(body) = core::str::from_utf8(body) else {
        return Sentence::Other;
    };
    let mut fields = body.split(',');
    let Some(tag) = fields.next() else {
        return Sentence::Other;
    };
    // talker prefix varies (GP, GN, GL); match on the sentence type
    match tag.get(2..) {
        Some("GGA") => decode_gga(fields).map_or(Sentence::Other, Sentence::Gga),
        Some("RMC") => decode_rmc(fields).map_or(Sentence::Other, Sentence::Rmc),
        _ => Sentence::Other,
    }
}

fn decode_gga<'a>(mut fields: impl Iterator<Item = &'a str>) -> Option<GgaFix> {
    let time = parse_f32(fields.next()?)?;
    let latitude = parse_angle(fields.next()?, fields.next()?, 2)?;
    let longitude = parse_angle(fields.next()?, fields.next()?, 3)?;
    let quality = fields.next()?.parse().ok()?;
    let satellites = fields.next()?.parse().ok()?;
    let hdop = parse_f32(fields.next()?).unwrap_or(99.9);
    let altitude = parse_f32(fields.next()?)?;
    Some(GgaFix {
        time,
        latitude,
        longitude,
        quality,
        satellites,
        hdop,
        altitude,
    })
}

fn decode_rmc<'a>(mut fields: impl Iterator<Item = &'a str>) -> Option<RmcFix> {
    let time = parse_f32(fields.next()?)?;
    let valid = fields.next()? == "A";
    let latitude = parse_angle(fields.next()?, fields.next()?, 2)?;
    let longitude = parse_angle(fields.next()?, fields.next()?, 3)?;
    let speed_knots = parse_f32(fields.next()?).unwrap_or(0.0);
    let course = parse_f32(fields.next()?).unwrap_or(0.0);
    let date = fields.next()?.parse().ok()?;
    Some(RmcFix {
        time,
        valid,
        latitude,
        longitude,
        speed_knots,
        course,
        date,
    })
}

fn parse_f32(s: &str) -> Option<f32> {
    s.parse().ok()
}

/// ddmm.mmmm (or dddmm.mmmm) plus hemisphere to signed decimal degrees.
///
/// Checked slicing: a corrupt sentence can pass the checksum and still
/// carry multi-byte characters, which must not split mid-character.
fn parse_angle(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    let degrees: f64 = value.get(..degree_digits)?.parse().ok()?;
    let minutes: f64 = value.get(degree_digits..)?.parse().ok()?;
    let angle = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(angle),
        "S" | "W" => Some(-angle),
        _ => None,
    }
}

/// Byte-stream front end over any `embedded_io::Read` UART.
pub struct Gnss<R> {
    uart: R,
    parser: NmeaParser,
}

impl<R, E> Gnss<R>
where
    R: Read<Error = E>,
{
    pub fn new(uart: R) -> Self {
        Self {
            uart,
            parser: NmeaParser::new(),
        }
    }

    pub fn free(self) -> R {
        self.uart
    }

    /// Read until one verified sentence completes. Corrupt sentences
    /// are skipped, not surfaced; a closed stream returns `Timeout`.
    pub fn next_sentence(&mut self) -> Result<Sentence, Error<E>> {
        let mut byte = [0u8; 1];
        loop {
            let n = self.uart.read(&mut byte).map_err(Error::Bus)?;
            if n == 0 {
                return Err(Error::Timeout);
            }
            match self.parser.push(byte[0]) {
                Ok(Some(sentence)) => return Ok(sentence),
                Ok(None) => {}
                Err(_) => {} // bad checksum, keep scanning
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,*76\r\n";
    const RMC: &str = "$GPRMC,081836,A,3751.65,S,14507.36,E,000.0,360.0,130998,011.3,E*62\r\n";

    fn feed(parser: &mut NmeaParser, text: &str) -> Option<Sentence> {
        let mut out = None;
        for b in text.bytes() {
            if let Ok(Some(s)) = parser.push(b) {
                out = Some(s);
            }
        }
        out
    }

    #[test]
    fn gga_decodes() {
        let mut parser = NmeaParser::new();
        let Some(Sentence::Gga(fix)) = feed(&mut parser, GGA) else {
            panic!("no GGA");
        };
        assert_eq!(fix.quality, 1);
        assert_eq!(fix.satellites, 8);
        assert!((fix.latitude - 53.361337).abs() < 1e-5);
        assert!((fix.longitude - -6.505620).abs() < 1e-5);
        assert!((fix.altitude - 61.7).abs() < 1e-3);
    }

    #[test]
    fn rmc_decodes() {
        let mut parser = NmeaParser::new();
        let Some(Sentence::Rmc(fix)) = feed(&mut parser, RMC) else {
            panic!("no RMC");
        };
        assert!(fix.valid);
        assert!((fix.latitude - -37.860833).abs() < 1e-5);
        assert!((fix.longitude - 145.122667).abs() < 1e-5);
        assert_eq!(fix.date, 130998);
        assert!((fix.speed_knots - 0.0).abs() < 1e-6);
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut parser = NmeaParser::new();
        let corrupt = GGA.replace("*76", "*77");
        for b in corrupt.bytes() {
            match parser.push(b) {
                Ok(Some(_)) => panic!("corrupt sentence accepted"),
                Ok(None) => {}
                Err(Error::Crc { computed, received }) => {
                    assert_eq!(computed, 0x76);
                    assert_eq!(received, 0x77);
                    return;
                }
                Err(_) => panic!("wrong error"),
            }
        }
        panic!("checksum never checked");
    }

    #[test]
    fn multibyte_garbage_in_latitude_is_rejected() {
        // corrupt latitude with a two-byte character straddling the
        // degree/minute split; checksum is valid so decoding must
        // degrade gracefully, never slice mid-character
        let body = "GPGGA,092750.000,a\u{e9}21.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,";
        let cs = body.bytes().fold(0u8, |acc, b| acc ^ b);
        let line = format!("${body}*{cs:02X}\r\n");
        let mut parser = NmeaParser::new();
        assert_eq!(feed(&mut parser, &line), Some(Sentence::Other));
    }

    #[test]
    fn unknown_talker_is_other() {
        let mut parser = NmeaParser::new();
        // GSV with a valid checksum
        let out = feed(
            &mut parser,
            "$GPGSV,3,1,11,03,03,111,00,04,15,270,00,06,01,010,00,13,06,292,00*74\r\n",
        );
        assert_eq!(out, Some(Sentence::Other));
    }

    #[test]
    fn stream_front_end_skips_noise() {
        let stream = [b"garbage\r\n" as &[u8], GGA.as_bytes()].concat();
        let mut gnss = Gnss::new(stream.as_slice());
        assert!(matches!(gnss.next_sentence(), Ok(Sentence::Gga(_))));
        assert!(matches!(gnss.next_sentence(), Err(Error::Timeout)));
    }
}
